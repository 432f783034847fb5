//! Extraction of scoring inputs from PDB structure files.
//!
//! This is plain blocking file IO and parsing; callers run it on the blocking pool.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::StructureError;
use crate::scoring::{ScoringRequest, SiteKind};
use crate::store::SiteRecord;

/// Resolves, parses and checks the structure of one site, producing the request body.
pub fn build_request(
  data_root: &Path,
  structure_base_url: &str,
  site: &SiteRecord,
) -> Result<ScoringRequest, StructureError> {
  let (path, relative) = resolve(data_root, &site.structure_file)?;
  let contents = std::fs::read_to_string(&path).map_err(|e| StructureError::Unreadable {
    path: path.clone(),
    message: e.to_string(),
  })?;
  let chains = chain_sequences(&contents);

  let protein_sequence = chains
    .iter()
    .find(|(chain_id, _)| *chain_id == site.chain_id)
    .map(|(_, sequence)| sequence.clone())
    .filter(|sequence| !sequence.is_empty())
    .ok_or_else(|| StructureError::NoProteinChain {
      path: path.clone(),
      chain_id: site.chain_id.clone(),
    })?;

  let ligand_sequence = match site.kind {
    SiteKind::Core => None,
    SiteKind::Interface => Some(
      chains
        .iter()
        .find(|(chain_id, sequence)| *chain_id != site.chain_id && !sequence.is_empty())
        .map(|(_, sequence)| sequence.clone())
        .ok_or_else(|| StructureError::NoLigandChain(path.clone()))?,
    ),
  };

  check_mutation(&protein_sequence, &site.mutation)?;

  let relative = relative
    .components()
    .map(|c| c.as_os_str().to_string_lossy().into_owned())
    .collect::<Vec<_>>()
    .join("/");
  Ok(ScoringRequest {
    protein_structure_url: format!("{}/{}", structure_base_url.trim_end_matches('/'), relative),
    protein_sequence,
    ligand_sequence,
    mutations: site.mutation.clone(),
  })
}

/// Returns the canonical path and its part below the canonical data root.
fn resolve(data_root: &Path, structure_file: &str) -> Result<(PathBuf, PathBuf), StructureError> {
  let joined = data_root.join(structure_file);
  if !joined.is_file() {
    return Err(StructureError::Missing(joined));
  }
  let unreadable = |path: &Path, e: std::io::Error| StructureError::Unreadable {
    path: path.to_path_buf(),
    message: e.to_string(),
  };
  let root = data_root
    .canonicalize()
    .map_err(|e| unreadable(data_root, e))?;
  let path = joined.canonicalize().map_err(|e| unreadable(&joined, e))?;
  let relative = path
    .strip_prefix(&root)
    .map_err(|_| StructureError::OutsideDataRoot(path.clone()))?
    .to_path_buf();
  Ok((path, relative))
}

/// Parses `<wt><position><mut>` and checks the wild-type residue against the sequence.
fn check_mutation(sequence: &str, mutation: &str) -> Result<(), StructureError> {
  let malformed = || StructureError::MalformedMutation(mutation.to_string());
  let mut chars = mutation.chars();
  let wild_type = chars.next().filter(char::is_ascii_uppercase).ok_or_else(malformed)?;
  chars.next_back().filter(char::is_ascii_uppercase).ok_or_else(malformed)?;
  let position: usize = chars.as_str().parse().map_err(|_| malformed())?;
  if position == 0 {
    return Err(malformed());
  }
  let found = sequence.chars().nth(position - 1);
  if found == Some(wild_type) {
    Ok(())
  } else {
    Err(StructureError::MutationMismatch {
      mutation: mutation.to_string(),
      found: found.map(String::from).unwrap_or_default(),
    })
  }
}

/// One-letter sequences of every chain in the first model, in file order.
/// Residues without a standard one-letter code are dropped.
pub fn chain_sequences(pdb: &str) -> Vec<(String, String)> {
  let mut chains: Vec<(String, String)> = Vec::new();
  let mut index: HashMap<String, usize> = HashMap::new();
  let mut last_residue: Option<(String, String)> = None;

  for line in pdb.lines() {
    if line.starts_with("ENDMDL") {
      break;
    }
    if !line.starts_with("ATOM  ") || line.len() < 27 {
      continue;
    }
    let (Some(res_name), Some(chain_id), Some(res_seq)) =
      (line.get(17..20), line.get(21..22), line.get(22..27))
    else {
      continue;
    };
    let chain_id = chain_id.trim().to_string();
    let residue = (chain_id.clone(), res_seq.to_string());
    if last_residue.as_ref() == Some(&residue) {
      continue;
    }
    last_residue = Some(residue);

    let slot = *index.entry(chain_id.clone()).or_insert_with(|| {
      chains.push((chain_id, String::new()));
      chains.len() - 1
    });
    if let Some(code) = one_letter(res_name.trim()) {
      chains[slot].1.push(code);
    }
  }
  chains
}

fn one_letter(three: &str) -> Option<char> {
  let code = match three {
    "ALA" => 'A',
    "ARG" => 'R',
    "ASN" => 'N',
    "ASP" => 'D',
    "CYS" => 'C',
    "GLN" => 'Q',
    "GLU" => 'E',
    "GLY" => 'G',
    "HIS" => 'H',
    "ILE" => 'I',
    "LEU" => 'L',
    "LYS" => 'K',
    "MET" => 'M',
    "PHE" => 'F',
    "PRO" => 'P',
    "SER" => 'S',
    "THR" => 'T',
    "TRP" => 'W',
    "TYR" => 'Y',
    "VAL" => 'V',
    _ => return None,
  };
  Some(code)
}
