//! Scripted platform and event recorder for tests.

use std::{
   future, io,
   sync::atomic::{AtomicBool, Ordering},
   time::Duration,
};

use bluer::Address;
use parking_lot::Mutex;
use smol_str::SmolStr;
use tokio::{
   io::{DuplexStream, duplex},
   sync::{mpsc, oneshot},
   task::JoinHandle,
   time,
};

use crate::{
   bluetooth::platform::{BondedDevice, Platform, PlatformEvent, ScanId},
   error::Result,
   event::{EventBus, SerialEvent},
};

const WAIT_LIMIT: Duration = Duration::from_secs(2);

pub type OpenReply = oneshot::Sender<io::Result<DuplexStream>>;

pub fn addr(last: u8) -> Address {
   Address::new([0x00, 0x1A, 0x7D, 0xDA, 0x71, last])
}

pub fn bonded(last: u8, name: &str) -> BondedDevice {
   BondedDevice {
      address: addr(last),
      name: Some(SmolStr::new(name)),
   }
}

#[derive(Default)]
pub struct MockPlatform {
   unavailable: AtomicBool,
   bonded: Mutex<Vec<BondedDevice>>,
   opens: Mutex<Vec<(Address, OpenReply)>>,
   scans: Mutex<Vec<(ScanId, mpsc::Sender<PlatformEvent>)>>,
   bond_sink: Mutex<Option<mpsc::Sender<PlatformEvent>>>,
}

impl MockPlatform {
   pub fn set_available(&self, available: bool) {
      self.unavailable.store(!available, Ordering::Relaxed);
   }

   pub fn set_bonded(&self, devices: Vec<BondedDevice>) {
      *self.bonded.lock() = devices;
   }

   pub fn scans(&self) -> Vec<ScanId> {
      self.scans.lock().iter().map(|(scan, _)| *scan).collect()
   }

   /// Sink handed to the most recent discovery round.
   pub fn scan_sink(&self) -> Option<(ScanId, mpsc::Sender<PlatformEvent>)> {
      self.scans.lock().last().cloned()
   }

   pub fn bond_sink(&self) -> Option<mpsc::Sender<PlatformEvent>> {
      self.bond_sink.lock().clone()
   }

   /// Waits until a connect to `address` is in flight and takes its reply.
   pub async fn next_open(&self, address: Address) -> OpenReply {
      let wait = async {
         loop {
            {
               let mut opens = self.opens.lock();
               if let Some(pos) = opens.iter().position(|(a, _)| *a == address) {
                  return opens.remove(pos).1;
               }
            }
            time::sleep(Duration::from_millis(1)).await;
         }
      };
      time::timeout(WAIT_LIMIT, wait)
         .await
         .unwrap_or_else(|_| panic!("no connect to {address} started"))
   }
}

/// Completes an open successfully and returns the remote end of the stream.
pub fn establish(reply: OpenReply) -> DuplexStream {
   let (local, remote) = duplex(4096);
   assert!(reply.send(Ok(local)).is_ok(), "attempt was already cancelled");
   remote
}

impl Platform for MockPlatform {
   type Link = DuplexStream;

   async fn is_available(&self) -> bool {
      !self.unavailable.load(Ordering::Relaxed)
   }

   async fn bonded_devices(&self) -> Result<Vec<BondedDevice>> {
      Ok(self.bonded.lock().clone())
   }

   async fn start_discovery(
      &self,
      scan: ScanId,
      sink: mpsc::Sender<PlatformEvent>,
   ) -> Result<JoinHandle<()>> {
      self.scans.lock().push((scan, sink));
      Ok(tokio::spawn(future::pending::<()>()))
   }

   async fn watch_bonds(&self, sink: mpsc::Sender<PlatformEvent>) -> Result<JoinHandle<()>> {
      *self.bond_sink.lock() = Some(sink);
      Ok(tokio::spawn(future::pending::<()>()))
   }

   async fn open(&self, address: Address) -> io::Result<DuplexStream> {
      let (tx, rx) = oneshot::channel();
      self.opens.lock().push((address, tx));
      rx.await.unwrap_or_else(|_| {
         Err(io::Error::new(
            io::ErrorKind::ConnectionAborted,
            "open abandoned by test",
         ))
      })
   }
}

/// Event bus that keeps everything it is given.
#[derive(Default)]
pub struct RecordingBus {
   events: Mutex<Vec<SerialEvent>>,
}

impl RecordingBus {
   pub fn events(&self) -> Vec<SerialEvent> {
      self.events.lock().clone()
   }

   pub fn take(&self) -> Vec<SerialEvent> {
      std::mem::take(&mut *self.events.lock())
   }

   /// Waits until some recorded event matches `pred`.
   pub async fn wait_for<F>(&self, mut pred: F)
   where
      F: FnMut(&SerialEvent) -> bool,
   {
      let wait = async {
         loop {
            if self.events.lock().iter().any(&mut pred) {
               return;
            }
            time::sleep(Duration::from_millis(1)).await;
         }
      };
      if time::timeout(WAIT_LIMIT, wait).await.is_err() {
         panic!("event never arrived; got {:?}", self.events());
      }
   }
}

impl EventBus for RecordingBus {
   fn emit(&self, event: SerialEvent) {
      self.events.lock().push(event);
   }
}
