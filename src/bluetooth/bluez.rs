//! [`Platform`] implementation on top of BlueZ.
//!
//! Serial connections go through an SPP client profile registered with
//! `bluetoothd`: a connect asks BlueZ to connect the profile, and the socket
//! is handed back through the profile's connect requests. When a fixed
//! RFCOMM channel is configured the socket is opened directly instead.

use std::{
   collections::{HashMap, HashSet},
   io,
   pin::pin,
   sync::Arc,
   time::Duration,
};

use bluer::{
   Adapter, AdapterEvent, Address, Device, DeviceEvent, DeviceProperty, DiscoveryFilter,
   DiscoveryTransport, Session,
   rfcomm::{Profile, ProfileHandle, Role, SocketAddr, Stream},
};
use futures::StreamExt;
use log::{debug, info, warn};
use parking_lot::Mutex;
use smol_str::SmolStr;
use tokio::{
   select,
   sync::{mpsc, oneshot},
   task::{AbortHandle, JoinHandle, JoinSet},
   time,
};

use crate::{
   bluetooth::platform::{BondedDevice, Platform, PlatformEvent, SPP_UUID, ScanId},
   config::Config,
   error::{Result, SerialError},
};

type PendingLinks = Arc<Mutex<HashMap<Address, oneshot::Sender<bluer::Result<Stream>>>>>;

pub struct BluezPlatform {
   _session: Session,
   adapter: Adapter,
   scan_window: Duration,
   rfcomm_channel: Option<u8>,
   pending: PendingLinks,
   router: Option<JoinHandle<()>>,
}

impl Drop for BluezPlatform {
   fn drop(&mut self) {
      if let Some(router) = self.router.take() {
         router.abort();
      }
   }
}

impl BluezPlatform {
   pub async fn new(config: &Config) -> Result<Self> {
      let session = Session::new().await?;
      let adapter = match &config.adapter {
         Some(name) => session.adapter(name)?,
         None => session.default_adapter().await?,
      };
      info!("Using Bluetooth adapter {}", adapter.name());

      let pending = PendingLinks::default();
      let router = match config.rfcomm_channel {
         Some(channel) => {
            info!("Connecting on fixed RFCOMM channel {channel}");
            None
         },
         None => {
            let profile = Profile {
               uuid: SPP_UUID,
               role: Some(Role::Client),
               require_authentication: Some(false),
               require_authorization: Some(false),
               auto_connect: Some(false),
               ..Default::default()
            };
            let handle = session.register_profile(profile).await?;
            debug!("Registered serial port profile {SPP_UUID}");
            Some(tokio::spawn(route_profile_links(handle, pending.clone())))
         },
      };

      Ok(Self {
         _session: session,
         adapter,
         scan_window: config.scan_window(),
         rfcomm_channel: config.rfcomm_channel,
         pending,
         router,
      })
   }
}

impl Platform for BluezPlatform {
   type Link = Stream;

   async fn is_available(&self) -> bool {
      match self.adapter.is_powered().await {
         Ok(powered) => powered,
         Err(e) => {
            debug!("Adapter {} not usable: {e}", self.adapter.name());
            false
         },
      }
   }

   async fn bonded_devices(&self) -> Result<Vec<BondedDevice>> {
      let mut bonded = Vec::new();
      for address in self.adapter.device_addresses().await? {
         let device = self.adapter.device(address)?;
         if device.is_paired().await? {
            bonded.push(BondedDevice {
               address,
               name: device.name().await.ok().flatten().map(SmolStr::from),
            });
         }
      }
      Ok(bonded)
   }

   async fn start_discovery(
      &self,
      scan: ScanId,
      sink: mpsc::Sender<PlatformEvent>,
   ) -> Result<JoinHandle<()>> {
      let (ready_tx, ready_rx) = oneshot::channel();
      let task = tokio::spawn(run_discovery(
         self.adapter.clone(),
         scan,
         self.scan_window,
         sink,
         ready_tx,
      ));
      match ready_rx.await {
         Ok(Ok(())) => Ok(task),
         Ok(Err(e)) => Err(e.into()),
         Err(_) => Err(SerialError::AdapterUnavailable),
      }
   }

   async fn watch_bonds(&self, sink: mpsc::Sender<PlatformEvent>) -> Result<JoinHandle<()>> {
      let known = self.adapter.device_addresses().await?;
      let monitor = BondMonitor::new(self.adapter.clone(), sink);
      Ok(tokio::spawn(monitor.run(known)))
   }

   async fn open(&self, address: Address) -> io::Result<Stream> {
      if let Some(channel) = self.rfcomm_channel {
         return Stream::connect(SocketAddr::new(address, channel)).await;
      }

      let (tx, rx) = oneshot::channel();
      self.pending.lock().insert(address, tx);

      let device = self.adapter.device(address).map_err(io::Error::other)?;
      if let Err(e) = device.connect_profile(&SPP_UUID).await {
         self.pending.lock().remove(&address);
         return Err(io::Error::other(e));
      }

      match rx.await {
         Ok(link) => link.map_err(io::Error::other),
         Err(_) => Err(io::Error::new(
            io::ErrorKind::ConnectionAborted,
            "profile connection was not delivered",
         )),
      }
   }
}

/// Hands incoming profile connections to the `open` call waiting for them.
async fn route_profile_links(handle: ProfileHandle, pending: PendingLinks) {
   let mut requests = pin!(handle);
   while let Some(req) = requests.next().await {
      let address = req.device();
      let Some(waiter) = pending.lock().remove(&address) else {
         debug!("Dropping unsolicited serial connection from {address}");
         continue;
      };
      if waiter.send(req.accept()).is_err() {
         debug!("Connect to {address} was abandoned before the link arrived");
      }
   }
   warn!("Serial port profile was unregistered");
}

async fn run_discovery(
   adapter: Adapter,
   scan: ScanId,
   window: Duration,
   sink: mpsc::Sender<PlatformEvent>,
   ready: oneshot::Sender<bluer::Result<()>>,
) {
   let filter = DiscoveryFilter {
      transport: DiscoveryTransport::BrEdr,
      ..Default::default()
   };
   if let Err(e) = adapter.set_discovery_filter(filter).await {
      warn!("Could not restrict discovery to BR/EDR: {e}");
   }

   let events = match adapter.discover_devices().await {
      Ok(events) => events,
      Err(e) => {
         let _ = ready.send(Err(e));
         return;
      },
   };
   let mut events = pin!(events);
   let _ = ready.send(Ok(()));
   let _ = sink.send(PlatformEvent::DiscoveryStarted { scan }).await;

   let mut deadline = pin!(time::sleep(window));
   let mut sightings = JoinSet::new();
   loop {
      select! {
         () = &mut deadline => break,
         event = events.next() => match event {
            Some(AdapterEvent::DeviceAdded(address)) => {
               let Ok(device) = adapter.device(address) else {
                  continue;
               };
               sightings.spawn(track_sighting(device, scan, sink.clone()));
            },
            Some(_) => {},
            None => break,
         },
         Some(_) = sightings.join_next() => {},
      }
   }

   sightings.abort_all();
   let _ = sink.send(PlatformEvent::DiscoveryFinished { scan }).await;
}

/// What one discovery round has learned about a device.
///
/// BlueZ lists every device it has cached when discovery starts, in range or
/// not. Only a device with a signal strength reading has actually been heard.
#[derive(Debug)]
struct Sighting {
   heard: bool,
   name: Option<SmolStr>,
}

impl Sighting {
   fn new(rssi: Option<i16>, name: Option<String>) -> Self {
      Self {
         heard: rssi.is_some(),
         name: name.map(SmolStr::from),
      }
   }

   /// Applies a property change. Returns whether the device should be
   /// reported now.
   fn update(&mut self, property: DeviceProperty) -> bool {
      match property {
         DeviceProperty::Rssi(_) if !self.heard => {
            self.heard = true;
            true
         },
         DeviceProperty::Name(name) => {
            self.name = Some(name.into());
            self.heard
         },
         _ => false,
      }
   }

   /// Nothing left to learn once the device is heard and named.
   const fn is_complete(&self) -> bool {
      self.heard && self.name.is_some()
   }

   fn found(&self, scan: ScanId, address: Address) -> PlatformEvent {
      PlatformEvent::DeviceFound {
         scan,
         address,
         name: self.name.clone(),
      }
   }
}

/// Reports a device once it is heard during this round, and again when its
/// name resolves.
async fn track_sighting(device: Device, scan: ScanId, sink: mpsc::Sender<PlatformEvent>) {
   let address = device.address();
   let Ok(events) = device.events().await else {
      return;
   };
   let mut events = pin!(events);

   let rssi = device.rssi().await.ok().flatten();
   let name = device.name().await.ok().flatten();
   let mut sighting = Sighting::new(rssi, name);
   if sighting.heard {
      if sink.send(sighting.found(scan, address)).await.is_err() {
         return;
      }
   } else {
      debug!("{address} is only cached, waiting to hear it");
   }

   while !sighting.is_complete() {
      let Some(DeviceEvent::PropertyChanged(property)) = events.next().await else {
         return;
      };
      if sighting.update(property) && sink.send(sighting.found(scan, address)).await.is_err() {
         return;
      }
   }
}

async fn watch_pairing(device: Device, changes: mpsc::Sender<(Address, bool)>) {
   let Ok(events) = device.events().await else {
      return;
   };
   let mut events = pin!(events);
   while let Some(event) = events.next().await {
      if let DeviceEvent::PropertyChanged(DeviceProperty::Paired(paired)) = event
         && changes.send((device.address(), paired)).await.is_err()
      {
         return;
      }
   }
}

struct BondMonitor {
   adapter: Adapter,
   sink: mpsc::Sender<PlatformEvent>,
   bonded: HashSet<Address>,
   watches: HashMap<Address, AbortHandle>,
   jset: JoinSet<()>,
   changes_tx: mpsc::Sender<(Address, bool)>,
   changes_rx: mpsc::Receiver<(Address, bool)>,
}

impl BondMonitor {
   fn new(adapter: Adapter, sink: mpsc::Sender<PlatformEvent>) -> Self {
      let (changes_tx, changes_rx) = mpsc::channel(16);
      Self {
         adapter,
         sink,
         bonded: HashSet::new(),
         watches: HashMap::new(),
         jset: JoinSet::new(),
         changes_tx,
         changes_rx,
      }
   }

   async fn track(&mut self, address: Address) {
      if self.watches.contains_key(&address) {
         return;
      }
      let Ok(device) = self.adapter.device(address) else {
         return;
      };
      if device.is_paired().await.unwrap_or(false) {
         self.bonded.insert(address);
      }
      let handle = self
         .jset
         .spawn(watch_pairing(device, self.changes_tx.clone()));
      self.watches.insert(address, handle);
   }

   async fn report(&mut self, address: Address, bonded: bool) -> bool {
      let changed = if bonded {
         self.bonded.insert(address)
      } else {
         self.bonded.remove(&address)
      };
      if !changed {
         return true;
      }
      self
         .sink
         .send(PlatformEvent::BondChanged { address, bonded })
         .await
         .is_ok()
   }

   async fn run(mut self, known: Vec<Address>) {
      let adapter = self.adapter.clone();
      let events = match adapter.events().await {
         Ok(events) => events,
         Err(e) => {
            warn!("Cannot watch adapter {}: {e}", adapter.name());
            return;
         },
      };
      let mut events = pin!(events);

      for address in known {
         self.track(address).await;
      }
      debug!("Watching pairing state of {} devices", self.watches.len());

      loop {
         select! {
            event = events.next() => match event {
               Some(AdapterEvent::DeviceAdded(address)) => self.track(address).await,
               Some(AdapterEvent::DeviceRemoved(address)) => {
                  if let Some(handle) = self.watches.remove(&address) {
                     handle.abort();
                  }
                  if !self.report(address, false).await {
                     break;
                  }
               },
               Some(_) => {},
               None => {
                  warn!("Adapter {} went away", adapter.name());
                  break;
               },
            },
            Some((address, paired)) = self.changes_rx.recv() => {
               if !self.report(address, paired).await {
                  break;
               }
            },
            Some(_) = self.jset.join_next() => {},
         }
      }
   }
}
