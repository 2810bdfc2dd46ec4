//! Events delivered to the consumer of the service.
//!
//! Discovery progress, connection state changes, received data and errors
//! all travel through one [`EventBus`] so that the consumer observes them in
//! emission order.

use std::{fmt, sync::Arc, time::Duration};

use bluer::Address;
use smol_str::SmolStr;

use crate::{
   bluetooth::session::Packet,
   error::{ErrorKind, SerialError},
   registry::DeviceEntry,
};

/// Connection state owned by the connection manager.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Default,
   strum::Display,
   strum::IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
pub enum ConnectionState {
   #[default]
   None,
   Connecting,
   Connected,
}

impl ConnectionState {
   pub fn to_str(self) -> &'static str {
      self.into()
   }
}

/// Identifies the target of a connection for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceLabel {
   pub address: Address,
   pub name: Option<SmolStr>,
}

impl fmt::Display for DeviceLabel {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match &self.name {
         Some(name) => write!(f, "{name} ({})", self.address),
         None => write!(f, "{}", self.address),
      }
   }
}

/// Events that can be emitted by the service.
#[derive(Debug, Clone, PartialEq)]
pub enum SerialEvent {
   ScanStarted,
   /// A device was added to the registry or had its name resolved.
   DeviceFound(DeviceEntry),
   ScanFinished {
      device_count: usize,
      elapsed: Duration,
   },
   BondChanged {
      address: Address,
      bonded: bool,
   },
   StateChanged {
      state: ConnectionState,
      device: Option<DeviceLabel>,
   },
   DataReceived(Packet),
   Error {
      kind: ErrorKind,
      detail: String,
   },
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to the consumer.
   fn emit(&self, event: SerialEvent);

   /// Emits an `Error` event for errors the consumer is told about.
   fn emit_error(&self, error: &SerialError) {
      if let Some(kind) = error.kind() {
         self.emit(SerialEvent::Error {
            kind,
            detail: error.to_string(),
         });
      }
   }
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;
