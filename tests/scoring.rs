mod common;

use std::sync::Arc;

use jobsubmitter::error::StructureError;
use jobsubmitter::job::{JobHeader, JobKind};
use jobsubmitter::scoring::{
  CollectOutcome, RemoteScore, ScoringCollect, ScoringSubmit, SiteKind, SubmitScoringOutcome,
};
use jobsubmitter::store::{MutationStatus, SiteRecord};
use jobsubmitter::{Item, JobFamily, JobKey};

use crate::common::{harness, setup_tracing, Harness};

const PDB: &str = "\
ATOM      1  N   MET A   1      11.104   6.134  -6.504  1.00  0.00           N
ATOM      2  N   GLY A   2      12.000   6.000  -4.000  1.00  0.00           N
ATOM      3  N   LYS A   3      12.000   6.000  -4.000  1.00  0.00           N
ATOM      4  N   SER B   1      12.000   6.000  -4.000  1.00  0.00           N
ATOM      5  N   TRP B   2      12.000   6.000  -4.000  1.00  0.00           N
END
";

fn write_structure(h: &Harness) {
  let dir = h.root().join("structures");
  std::fs::create_dir_all(&dir).expect("structure dir");
  std::fs::write(dir.join("P1.pdb"), PDB).expect("structure file");
}

fn site(kind: SiteKind, id: i64, structure_file: &str) -> SiteRecord {
  SiteRecord {
    kind,
    domain_or_interface_id: id,
    structure_file: structure_file.to_string(),
    chain_id: "A".to_string(),
    mutation: "G2A".to_string(),
  }
}

/// A validated mutation record, registered for completion tracking.
fn mutation_record(h: &Harness) -> Item {
  let header = Arc::new(JobHeader {
    job_key: JobKey::new("21", Some("user@example.com".to_string())),
    family: JobFamily::Database,
    protein_id: "P1".to_string(),
    structure_file: None,
    sequence_file: None,
    domain_pair_ids: Vec::new(),
  });
  let item = Item::new(
    JobKind::Mutation {
      mutation: "G12A".to_string(),
    },
    header,
    &h.ctx.layout,
  );
  h.ctx
    .state
    .monitor(item.job_key().clone(), [item.unique_id().clone()]);
  item
}

fn core_score(value: f64) -> RemoteScore {
  RemoteScore {
    protbert_core_score: Some(value),
    proteinsolver_core_score: Some(value + 0.25),
    el2core_score: Some(value + 0.5),
    ..RemoteScore::default()
  }
}

fn interface_score(value: f64) -> RemoteScore {
  RemoteScore {
    protbert_interface_score: Some(value),
    proteinsolver_interface_score: Some(value + 0.25),
    el2interface_score: Some(value + 0.5),
    ..RemoteScore::default()
  }
}

#[tokio::test]
async fn core_and_interface_scores_are_committed_once() {
  setup_tracing();
  let h = harness();
  write_structure(&h);
  h.store.insert_result("P1", "G12A");
  h.store.insert_sites(
    JobFamily::Database,
    "P1",
    "G12A",
    vec![
      site(SiteKind::Core, 10, "structures/P1.pdb"),
      site(SiteKind::Interface, 20, "structures/P1.pdb"),
    ],
  );
  let item = mutation_record(&h);

  let outcome = ScoringSubmit::new(h.ctx.clone()).process(item).await;
  assert_eq!(outcome, SubmitScoringOutcome::Posted(2));
  assert_eq!(h.ctx.state.scoring_running_queue.len(), 1);

  let requests = h.scoring.posted_requests();
  assert_eq!(
    requests[0].protein_structure_url,
    "http://static.test/structures/P1.pdb"
  );
  assert_eq!(requests[0].protein_sequence, "MGK");
  assert_eq!(requests[0].ligand_sequence, None);
  assert_eq!(requests[1].ligand_sequence.as_deref(), Some("SW"));
  assert_eq!(requests[1].mutations, "G2A");

  let collect = ScoringCollect::new(h.ctx.clone());
  assert_eq!(collect.pass().await, vec![CollectOutcome::Pending]);
  assert_eq!(h.ctx.state.scoring_running_queue.len(), 1);

  let urls = h.scoring.posted_urls();
  h.scoring.complete(&urls[0], vec![core_score(0.5)]);
  h.scoring.complete(&urls[1], vec![interface_score(1.5)]);

  assert_eq!(
    collect.pass().await,
    vec![CollectOutcome::Finalized {
      scored: 2,
      skipped: 0
    }]
  );
  assert!(h.ctx.state.scoring_running_queue.is_empty());
  assert!(collect.pass().await.is_empty());

  let scores = h.store.scores();
  assert_eq!(scores.len(), 2);
  let core = &scores
    .iter()
    .find(|(_, _, s)| s.kind == SiteKind::Core)
    .expect("core score")
    .2;
  assert_eq!(core.domain_or_interface_id, 10);
  assert_eq!(core.mutation, "G2A");
  assert_eq!(core.protbert_score, 0.5);
  assert_eq!(core.el2_score, 1.0);

  assert_eq!(h.store.mutation_status("P1", "G12A"), Some(MutationStatus::Done));
  let mut deleted = h.scoring.deleted();
  deleted.sort();
  assert_eq!(deleted, urls);
  assert_eq!(h.ctx.state.completed_jobs().len(), 1);
  assert_eq!(h.ctx.metrics.snapshot().scoring_finalized, 1);
}

#[tokio::test]
async fn failed_site_is_skipped() {
  setup_tracing();
  let h = harness();
  write_structure(&h);
  h.store.insert_sites(
    JobFamily::Database,
    "P1",
    "G12A",
    vec![
      site(SiteKind::Core, 10, "structures/P1.pdb"),
      site(SiteKind::Interface, 20, "structures/P1.pdb"),
    ],
  );
  let item = mutation_record(&h);
  ScoringSubmit::new(h.ctx.clone()).process(item).await;

  let urls = h.scoring.posted_urls();
  h.scoring.complete(&urls[0], vec![core_score(0.5)]);
  h.scoring.fail(&urls[1]);

  let outcome = ScoringCollect::new(h.ctx.clone()).pass().await;
  assert_eq!(
    outcome,
    vec![CollectOutcome::Finalized {
      scored: 1,
      skipped: 1
    }]
  );
  assert_eq!(h.store.scores().len(), 1);
  // No stability result in the store, so the mutation ends as an error.
  assert_eq!(h.store.mutation_status("P1", "G12A"), Some(MutationStatus::Error));
}

#[tokio::test]
async fn mutation_without_sites_is_finalized() {
  setup_tracing();
  let h = harness();
  h.store.insert_result("P1", "G12A");
  let item = mutation_record(&h);

  let outcome = ScoringSubmit::new(h.ctx.clone()).process(item).await;
  assert_eq!(outcome, SubmitScoringOutcome::NoSites);
  assert!(h.ctx.state.scoring_running_queue.is_empty());
  assert!(h.scoring.posted_urls().is_empty());
  assert_eq!(h.store.mutation_status("P1", "G12A"), Some(MutationStatus::Done));
  assert_eq!(h.ctx.state.completed_jobs().len(), 1);
}

#[tokio::test]
async fn missing_structure_is_a_domain_error() {
  setup_tracing();
  let h = harness();
  h.store.insert_sites(
    JobFamily::Database,
    "P1",
    "G12A",
    vec![site(SiteKind::Core, 10, "structures/missing.pdb")],
  );
  let item = mutation_record(&h);

  let outcome = ScoringSubmit::new(h.ctx.clone()).process(item).await;
  assert_eq!(
    outcome,
    SubmitScoringOutcome::DomainError(StructureError::Missing(
      h.root().join("structures/missing.pdb")
    ))
  );
  assert!(h.scoring.posted_urls().is_empty());
  assert!(h.ctx.state.scoring_pending_queue.is_empty());
  assert_eq!(h.store.mutation_status("P1", "G12A"), Some(MutationStatus::Error));

  let notices = h.notifier.admin_notices();
  assert_eq!(notices.len(), 1);
  assert!(!notices[0].restarting);
  assert_eq!(h.ctx.state.completed_jobs().len(), 1);
}

#[tokio::test]
async fn wild_type_mismatch_is_a_domain_error() {
  setup_tracing();
  let h = harness();
  write_structure(&h);
  let mut mismatched = site(SiteKind::Core, 10, "structures/P1.pdb");
  mismatched.mutation = "A2G".to_string();
  h.store
    .insert_sites(JobFamily::Database, "P1", "G12A", vec![mismatched]);
  let item = mutation_record(&h);

  let outcome = ScoringSubmit::new(h.ctx.clone()).process(item).await;
  assert!(matches!(
    outcome,
    SubmitScoringOutcome::DomainError(StructureError::MutationMismatch { .. })
  ));
}

#[tokio::test]
async fn transient_post_failure_requeues() {
  setup_tracing();
  let h = harness();
  write_structure(&h);
  h.store.insert_sites(
    JobFamily::Database,
    "P1",
    "G12A",
    vec![site(SiteKind::Core, 10, "structures/P1.pdb")],
  );
  h.scoring.fail_next_posts(1);
  let item = mutation_record(&h);
  let submit = ScoringSubmit::new(h.ctx.clone());

  assert_eq!(submit.process(item).await, SubmitScoringOutcome::Requeued);
  assert_eq!(h.ctx.state.scoring_pending_queue.len(), 1);
  assert!(h.ctx.state.completed_jobs().is_empty());

  let item = h.ctx.state.scoring_pending_queue.pop().expect("requeued");
  assert_eq!(submit.process(item).await, SubmitScoringOutcome::Posted(1));
}

#[tokio::test]
async fn store_outage_requeues() {
  setup_tracing();
  let h = harness();
  h.store.set_unavailable(true);
  let item = mutation_record(&h);

  let outcome = ScoringSubmit::new(h.ctx.clone()).process(item).await;
  assert_eq!(outcome, SubmitScoringOutcome::Requeued);
  assert_eq!(h.ctx.state.scoring_pending_queue.len(), 1);
}
