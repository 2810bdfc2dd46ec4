//! Discovery control and registry population.
//!
//! Translates platform discovery and bonding events into registry updates
//! and consumer notifications. Each round carries a [`ScanId`]; events from
//! a round that was cancelled or replaced are dropped.

use std::{mem, sync::Arc, time::Instant};

use log::{debug, info, warn};
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
   bluetooth::platform::{Platform, PlatformEvent, ScanId},
   capability::{Capability, CapabilityGate},
   error::{Result, SerialError},
   event::{EventSender, SerialEvent},
   registry::{RegistryRow, SharedRegistry},
};

enum ScanState {
   Idle,
   Scanning {
      scan: ScanId,
      started: Instant,
      task: JoinHandle<()>,
   },
}

pub struct DiscoveryController<P: Platform> {
   platform: Arc<P>,
   registry: SharedRegistry,
   capabilities: Arc<dyn CapabilityGate>,
   event_tx: EventSender,
   sink: mpsc::Sender<PlatformEvent>,
   state: ScanState,
   next_scan: u64,
}

impl<P: Platform> DiscoveryController<P> {
   pub fn new(
      platform: Arc<P>,
      registry: SharedRegistry,
      capabilities: Arc<dyn CapabilityGate>,
      event_tx: EventSender,
      sink: mpsc::Sender<PlatformEvent>,
   ) -> Self {
      Self {
         platform,
         registry,
         capabilities,
         event_tx,
         sink,
         state: ScanState::Idle,
         next_scan: 0,
      }
   }

   pub const fn is_scanning(&self) -> bool {
      matches!(self.state, ScanState::Scanning { .. })
   }

   fn is_current(&self, scan: ScanId) -> bool {
      matches!(self.state, ScanState::Scanning { scan: current, .. } if current == scan)
   }

   fn fail(&self, error: SerialError) -> SerialError {
      self.event_tx.emit_error(&error);
      error
   }

   /// Starts a fresh discovery round, restarting one already running.
   pub async fn start_scan(&mut self) -> Result<ScanId> {
      if !self.capabilities.is_granted(Capability::Scan) {
         return Err(self.fail(SerialError::CapabilityDenied(Capability::Scan)));
      }
      if !self.platform.is_available().await {
         return Err(self.fail(SerialError::AdapterUnavailable));
      }

      if let ScanState::Scanning { scan, task, .. } = mem::replace(&mut self.state, ScanState::Idle)
      {
         debug!("Restarting discovery, abandoning {scan}");
         task.abort();
      }

      self.next_scan += 1;
      let scan = ScanId(self.next_scan);
      let task = self.platform.start_discovery(scan, self.sink.clone()).await?;

      self.registry.lock().clear_discovered();
      self.state = ScanState::Scanning {
         scan,
         started: Instant::now(),
         task,
      };
      info!("Discovery started ({scan})");
      self.event_tx.emit(SerialEvent::ScanStarted);
      Ok(scan)
   }

   /// Stops the running round, if any. Returns whether one was running.
   pub fn cancel_scan(&mut self) -> bool {
      match mem::replace(&mut self.state, ScanState::Idle) {
         ScanState::Idle => false,
         ScanState::Scanning {
            scan,
            started,
            task,
         } => {
            task.abort();
            info!("Discovery cancelled ({scan})");
            self.finish(started);
            true
         },
      }
   }

   fn finish(&self, started: Instant) {
      let device_count = {
         let mut registry = self.registry.lock();
         registry.finish_discovery();
         registry.device_count()
      };
      let elapsed = started.elapsed();
      info!("Discovery finished: {device_count} devices in {elapsed:?}");
      self.event_tx.emit(SerialEvent::ScanFinished {
         device_count,
         elapsed,
      });
   }

   /// Rebuilds the paired section from the adapter's bonded set.
   pub async fn refresh_paired(&self) -> Result<Vec<RegistryRow>> {
      self
         .derive_paired()
         .await
         .map_err(|error| self.fail(error))
   }

   async fn derive_paired(&self) -> Result<Vec<RegistryRow>> {
      if !self.capabilities.is_granted(Capability::Connect) {
         return Err(SerialError::CapabilityDenied(Capability::Connect));
      }
      let bonded = self.platform.bonded_devices().await?;
      debug!("Adapter reports {} bonded devices", bonded.len());
      Ok(self
         .registry
         .lock()
         .upsert_paired(bonded.into_iter().map(|d| (d.address, d.name))))
   }

   pub async fn handle_event(&mut self, event: PlatformEvent) {
      match event {
         PlatformEvent::DiscoveryStarted { scan } => {
            debug!("Adapter confirmed {scan}");
         },
         PlatformEvent::DeviceFound {
            scan,
            address,
            name,
         } => {
            if !self.is_current(scan) {
               debug!("Dropping {address} from stale {scan}");
               return;
            }
            let name = if self.capabilities.is_granted(Capability::Connect) {
               name
            } else {
               if name.is_some() {
                  debug!("Connect capability missing, recording {address} without a name");
               }
               None
            };

            let found = {
               let mut registry = self.registry.lock();
               let outcome = registry.upsert_discovered(address, name);
               outcome
                  .is_changed()
                  .then(|| registry.get(address).cloned())
                  .flatten()
            };
            if let Some(entry) = found {
               debug!("Found {address} ({:?})", entry.name);
               self.event_tx.emit(SerialEvent::DeviceFound(entry));
            }
         },
         PlatformEvent::DiscoveryFinished { scan } => {
            if !self.is_current(scan) {
               debug!("Ignoring end of stale {scan}");
               return;
            }
            if let ScanState::Scanning { started, .. } =
               mem::replace(&mut self.state, ScanState::Idle)
            {
               self.finish(started);
            }
         },
         PlatformEvent::BondChanged { address, bonded } => {
            info!("Bond with {address} is now {}", if bonded { "present" } else { "gone" });
            if let Err(e) = self.derive_paired().await {
               warn!("Could not refresh paired devices: {e}");
            }
            self
               .event_tx
               .emit(SerialEvent::BondChanged { address, bonded });
         },
      }
   }
}
