//! Error types for the serial port service.
//!
//! This module defines all error types that can occur while discovering
//! devices, connecting to them and exchanging data, plus the reduced set of
//! error kinds that is reported to the event consumer.

use thiserror::Error;

use crate::capability::Capability;

/// Main error type for the serial port service.
#[derive(Error, Debug)]
pub enum SerialError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("D-Bus connection error: {0}")]
   DBusConnection(#[from] zbus::fdo::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Capability not granted: {0}")]
   CapabilityDenied(Capability),

   #[error("Connect failed: {0}")]
   ConnectFailed(String),

   #[error("Connection lost")]
   ConnectionLost,

   #[error("Adapter not available")]
   AdapterUnavailable,

   #[error("Not connected")]
   NotConnected,

   #[error("Invalid device address: {0}")]
   InvalidAddress(String),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Manager has been shut down")]
   ManagerShutdown,
}

impl SerialError {
   /// Kind reported to the event consumer, if this error has one.
   pub const fn kind(&self) -> Option<ErrorKind> {
      match self {
         Self::CapabilityDenied(_) => Some(ErrorKind::CapabilityDenied),
         Self::ConnectFailed(_) => Some(ErrorKind::ConnectFailed),
         Self::ConnectionLost => Some(ErrorKind::ConnectionLost),
         Self::AdapterUnavailable => Some(ErrorKind::AdapterUnavailable),
         _ => None,
      }
   }
}

/// Error kinds delivered to the consumer through `Error` events.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
   CapabilityDenied,
   ConnectFailed,
   ConnectionLost,
   AdapterUnavailable,
}

impl ErrorKind {
   pub fn to_str(self) -> &'static str {
      self.into()
   }
}

/// Convenience type alias for Results with `SerialError`.
pub type Result<T> = std::result::Result<T, SerialError>;
