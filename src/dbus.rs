use std::{str::FromStr, sync::Arc};

use bluer::Address;
use log::{info, warn};
use tokio::task::JoinHandle;
use zbus::{
   Connection, interface,
   object_server::{InterfaceRef, SignalEmitter},
};

use crate::{
   bluetooth::manager::BluetoothManager,
   capability::{Capability, CapabilitySet},
   dispatch::EventDispatcher,
   error::{Result, SerialError},
   event::{ConnectionState, SerialEvent},
   registry::rows_to_json,
};

pub const SERVICE_NAME: &str = "org.sppd";
pub const OBJECT_PATH: &str = "/org/sppd/manager";

pub struct SerialService {
   manager: BluetoothManager,
   capabilities: Arc<CapabilitySet>,
}

impl SerialService {
   pub const fn new(manager: BluetoothManager, capabilities: Arc<CapabilitySet>) -> Self {
      Self {
         manager,
         capabilities,
      }
   }
}

fn parse_address(address: &str) -> Result<Address> {
   Address::from_str(address).map_err(|_| SerialError::InvalidAddress(address.to_string()))
}

fn to_fdo(error: SerialError) -> zbus::fdo::Error {
   match error {
      SerialError::CapabilityDenied(_) => zbus::fdo::Error::AccessDenied(error.to_string()),
      SerialError::InvalidAddress(_) => zbus::fdo::Error::InvalidArgs(error.to_string()),
      _ => zbus::fdo::Error::Failed(error.to_string()),
   }
}

#[interface(name = "org.sppd.Manager")]
impl SerialService {
   async fn start_scan(&self) -> zbus::fdo::Result<()> {
      self.manager.start_scan().await.map_err(to_fdo)
   }

   async fn cancel_scan(&self) -> zbus::fdo::Result<bool> {
      self.manager.cancel_scan().await.map_err(to_fdo)
   }

   async fn refresh_paired(&self) -> zbus::fdo::Result<String> {
      let rows = self.manager.refresh_paired().await.map_err(to_fdo)?;
      Ok(rows_to_json(&rows).to_string())
   }

   async fn connect(&self, address: String) -> zbus::fdo::Result<()> {
      let addr = parse_address(&address).map_err(to_fdo)?;
      self.manager.connect(addr).await.map_err(to_fdo)
   }

   async fn disconnect(&self) -> zbus::fdo::Result<bool> {
      self.manager.disconnect().await.map_err(to_fdo)
   }

   async fn write(&self, data: Vec<u8>) -> zbus::fdo::Result<()> {
      self.manager.write(&data).await.map_err(to_fdo)
   }

   async fn write_hex(&self, packet: String) -> zbus::fdo::Result<()> {
      let data = hex::decode(packet.trim())
         .map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;
      self.manager.write(&data).await.map_err(to_fdo)
   }

   async fn get_devices(&self) -> String {
      rows_to_json(&self.manager.snapshot()).to_string()
   }

   async fn set_capability(&self, name: String, granted: bool) -> zbus::fdo::Result<bool> {
      let capability = Capability::from_str(&name)
         .map_err(|_| zbus::fdo::Error::InvalidArgs(format!("Unknown capability: {name}")))?;
      let previous = self.capabilities.set(capability, granted);
      if previous != granted {
         info!("Capability {capability} is now {}", if granted { "granted" } else { "revoked" });
      }
      Ok(previous)
   }

   // Signals
   #[zbus(signal)]
   pub async fn scan_started(emitter: &SignalEmitter<'_>) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_found(
      emitter: &SignalEmitter<'_>,
      address: &str,
      name: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn scan_finished(
      emitter: &SignalEmitter<'_>,
      count: u32,
      elapsed_ms: u64,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn bond_changed(
      emitter: &SignalEmitter<'_>,
      address: &str,
      bonded: bool,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn connection_state_changed(
      emitter: &SignalEmitter<'_>,
      state: &str,
      device: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn data_received(emitter: &SignalEmitter<'_>, data: &[u8]) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn error(emitter: &SignalEmitter<'_>, kind: &str, detail: &str) -> zbus::Result<()>;

   #[zbus(property)]
   async fn state(&self) -> String {
      self
         .manager
         .state()
         .await
         .map_or(ConnectionState::None, |(state, _)| state)
         .to_string()
   }

   #[zbus(property)]
   async fn devices(&self) -> String {
      self.get_devices().await
   }
}

/// Properties whose value an event changes.
#[derive(Debug, Default, PartialEq, Eq)]
struct ChangedProperties {
   state: bool,
   devices: bool,
}

impl ChangedProperties {
   const fn of(event: &SerialEvent) -> Self {
      match event {
         // The connected flag is part of every device row.
         SerialEvent::StateChanged { .. } => Self {
            state: true,
            devices: true,
         },
         SerialEvent::ScanStarted
         | SerialEvent::DeviceFound(_)
         | SerialEvent::ScanFinished { .. }
         | SerialEvent::BondChanged { .. } => Self {
            state: false,
            devices: true,
         },
         SerialEvent::DataReceived(_) | SerialEvent::Error { .. } => Self {
            state: false,
            devices: false,
         },
      }
   }

   async fn notify(&self, iface: &InterfaceRef<SerialService>) -> zbus::Result<()> {
      if *self == Self::default() {
         return Ok(());
      }
      let service = iface.get().await;
      let emitter = iface.signal_emitter();
      if self.state {
         service.state_changed(emitter).await?;
      }
      if self.devices {
         service.devices_changed(emitter).await?;
      }
      Ok(())
   }
}

async fn dispatch(iface: &InterfaceRef<SerialService>, event: SerialEvent) -> Result<()> {
   let changed = ChangedProperties::of(&event);
   match event {
      SerialEvent::ScanStarted => {
         iface.scan_started().await?;
      },
      SerialEvent::DeviceFound(entry) => {
         iface
            .device_found(&entry.address.to_string(), entry.name.as_deref().unwrap_or(""))
            .await?;
      },
      SerialEvent::ScanFinished {
         device_count,
         elapsed,
      } => {
         let count = u32::try_from(device_count).unwrap_or(u32::MAX);
         let elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
         iface.scan_finished(count, elapsed_ms).await?;
      },
      SerialEvent::BondChanged { address, bonded } => {
         iface.bond_changed(&address.to_string(), bonded).await?;
      },
      SerialEvent::StateChanged { state, device } => {
         let device = device.map(|d| d.address.to_string()).unwrap_or_default();
         iface
            .connection_state_changed(state.to_str(), &device)
            .await?;
      },
      SerialEvent::DataReceived(data) => {
         iface.data_received(&data).await?;
      },
      SerialEvent::Error { kind, detail } => {
         iface.error(kind.to_str(), &detail).await?;
      },
   }
   changed.notify(iface).await?;
   Ok(())
}

/// Forwards every dispatched event as the matching signal, in order.
///
/// The task ends once every producer of `dispatcher` is gone.
pub async fn forward_events(
   dispatcher: Arc<EventDispatcher>,
   connection: &Connection,
) -> Result<JoinHandle<()>> {
   let iface = connection
      .object_server()
      .interface::<_, SerialService>(OBJECT_PATH)
      .await?;
   Ok(tokio::spawn(async move {
      while let Some(event) = dispatcher.recv().await {
         if let Err(e) = dispatch(&iface, event).await {
            warn!("Error dispatching event: {e}");
         }
      }
   }))
}
