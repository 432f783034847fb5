//! Cooperative cancellation for the pipeline loops.

use std::time::Duration;

use tokio::sync::watch;

use crate::error::ShutdownError;

/// Sending half, owned by the `JobSubmitter` handle.
#[derive(Debug)]
pub struct ShutdownTrigger {
  tx: watch::Sender<bool>,
}

/// Receiving half, cloned into every loop.
#[derive(Debug, Clone)]
pub struct Shutdown {
  rx: watch::Receiver<bool>,
}

pub fn channel() -> (ShutdownTrigger, Shutdown) {
  let (tx, rx) = watch::channel(false);
  (ShutdownTrigger { tx }, Shutdown { rx })
}

impl ShutdownTrigger {
  pub fn trigger(&self) -> Result<(), ShutdownError> {
    if *self.tx.borrow() {
      return Err(ShutdownError::AlreadyShuttingDown);
    }
    self.tx.send(true).map_err(|_| ShutdownError::SignalFailed)
  }

  pub fn is_triggered(&self) -> bool {
    *self.tx.borrow()
  }
}

impl Shutdown {
  pub fn is_triggered(&self) -> bool {
    *self.rx.borrow()
  }

  /// Resolves once shutdown was requested (or the trigger was dropped).
  pub async fn triggered(&mut self) {
    while !*self.rx.borrow_and_update() {
      if self.rx.changed().await.is_err() {
        return;
      }
    }
  }

  /// Sleeps for `duration`. Returns `false` if shutdown was requested first.
  pub async fn sleep(&mut self, duration: Duration) -> bool {
    if self.is_triggered() {
      return false;
    }
    tokio::select! {
      biased;
      _ = self.triggered() => false,
      _ = tokio::time::sleep(duration) => !self.is_triggered(),
    }
  }
}
