//! Boundary between the service core and the Bluetooth stack.
//!
//! The core never talks to the radio directly. Discovery, the bonded set,
//! bond notifications and socket setup all go through [`Platform`], which
//! is implemented for BlueZ in [`super::bluez`] and by a scripted mock in
//! tests.

use std::{fmt, future::Future, io};

use bluer::Address;
use smol_str::SmolStr;
use tokio::{
   io::{AsyncRead, AsyncWrite},
   sync::mpsc,
   task::JoinHandle,
};
use uuid::Uuid;

use crate::error::Result;

/// Standard Serial Port Profile service class
pub const SPP_UUID: Uuid = Uuid::from_u128(0x00001101_0000_1000_8000_00805f9b34fb);

/// Identifies one discovery round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScanId(pub u64);

impl fmt::Display for ScanId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "scan#{}", self.0)
   }
}

/// Events pushed by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformEvent {
   DiscoveryStarted {
      scan: ScanId,
   },
   /// `name` is the raw name as reported by the stack, if any.
   DeviceFound {
      scan: ScanId,
      address: Address,
      name: Option<SmolStr>,
   },
   DiscoveryFinished {
      scan: ScanId,
   },
   BondChanged {
      address: Address,
      bonded: bool,
   },
}

/// A device the adapter holds a bond with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BondedDevice {
   pub address: Address,
   pub name: Option<SmolStr>,
}

pub trait Platform: Send + Sync + 'static {
   /// Byte stream of an established serial connection.
   type Link: AsyncRead + AsyncWrite + Send + Unpin + 'static;

   /// Whether the adapter is present and powered.
   fn is_available(&self) -> impl Future<Output = bool> + Send;

   fn bonded_devices(&self) -> impl Future<Output = Result<Vec<BondedDevice>>> + Send;

   /// Starts one discovery round reporting into `sink`.
   ///
   /// The round ends with `DiscoveryFinished`; aborting the returned task
   /// stops it early without a finish event.
   fn start_discovery(
      &self,
      scan: ScanId,
      sink: mpsc::Sender<PlatformEvent>,
   ) -> impl Future<Output = Result<JoinHandle<()>>> + Send;

   /// Starts reporting bond changes into `sink` until the task is aborted.
   fn watch_bonds(
      &self,
      sink: mpsc::Sender<PlatformEvent>,
   ) -> impl Future<Output = Result<JoinHandle<()>>> + Send;

   /// Opens a serial stream to `address`. Dropping the future closes the
   /// half-open socket.
   fn open(&self, address: Address) -> impl Future<Output = io::Result<Self::Link>> + Send;
}
