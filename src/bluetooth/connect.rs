//! One-shot worker that opens a serial stream to a device.

use std::{fmt, io, sync::Arc};

use bluer::Address;
use log::{debug, info};
use tokio::{sync::mpsc, task::JoinHandle};

use crate::bluetooth::platform::Platform;

/// Identifies one connect attempt. A newer attempt always has a larger id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttemptId(pub u64);

impl fmt::Display for AttemptId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "attempt#{}", self.0)
   }
}

/// The single outcome of a connect attempt.
#[derive(Debug)]
pub enum ConnectOutcome<L> {
   Established { attempt: AttemptId, link: L },
   Failed { attempt: AttemptId, error: io::Error },
}

impl<L> ConnectOutcome<L> {
   pub const fn attempt(&self) -> AttemptId {
      match self {
         Self::Established { attempt, .. } | Self::Failed { attempt, .. } => *attempt,
      }
   }
}

/// In-flight connect attempt. Dropping it closes the half-open socket.
#[derive(Debug)]
pub struct ConnectWorker {
   id: AttemptId,
   address: Address,
   handle: JoinHandle<()>,
}

impl Drop for ConnectWorker {
   fn drop(&mut self) {
      self.handle.abort();
   }
}

impl ConnectWorker {
   pub fn spawn<P: Platform>(
      platform: Arc<P>,
      id: AttemptId,
      address: Address,
      outcomes: mpsc::Sender<ConnectOutcome<P::Link>>,
   ) -> Self {
      let handle = tokio::spawn(async move {
         info!("Connecting to {address} ({id})");
         let outcome = match platform.open(address).await {
            Ok(link) => ConnectOutcome::Established { attempt: id, link },
            Err(error) => ConnectOutcome::Failed { attempt: id, error },
         };
         if outcomes.send(outcome).await.is_err() {
            debug!("Manager gone, dropping outcome of {id}");
         }
      });

      Self {
         id,
         address,
         handle,
      }
   }

   pub const fn id(&self) -> AttemptId {
      self.id
   }

   pub const fn address(&self) -> Address {
      self.address
   }

   /// Abandons the attempt. An outcome already queued before the abort is
   /// left for the manager to discard by id.
   pub fn cancel(self) {
      debug!("Cancelling {} to {}", self.id, self.address);
   }
}
