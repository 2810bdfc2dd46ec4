//! Connection lifecycle.
//!
//! Owns the connection state together with at most one in-flight connect
//! attempt and at most one established session. Outcomes and reports carry
//! the id of the attempt or session that produced them, so anything coming
//! from a worker that has since been replaced is discarded here.

use std::{mem, sync::Arc};

use bluer::Address;
use log::{debug, info, warn};
use tokio::sync::mpsc;

use crate::{
   bluetooth::{
      connect::{AttemptId, ConnectOutcome, ConnectWorker},
      platform::Platform,
      session::{SessionId, SessionReport, SessionWorker, SessionWriter},
   },
   capability::{Capability, CapabilityGate},
   error::{ErrorKind, Result, SerialError},
   event::{ConnectionState, DeviceLabel, EventSender, SerialEvent},
   registry::SharedRegistry,
};

pub struct ConnectionManager<P: Platform> {
   platform: Arc<P>,
   registry: SharedRegistry,
   capabilities: Arc<dyn CapabilityGate>,
   event_tx: EventSender,
   outcomes: mpsc::Sender<ConnectOutcome<P::Link>>,
   reports: mpsc::Sender<SessionReport>,
   read_buffer_size: usize,

   state: ConnectionState,
   target: Option<Address>,
   attempt: Option<ConnectWorker>,
   session: Option<SessionWorker>,
   next_id: u64,
}

impl<P: Platform> ConnectionManager<P> {
   pub fn new(
      platform: Arc<P>,
      registry: SharedRegistry,
      capabilities: Arc<dyn CapabilityGate>,
      event_tx: EventSender,
      outcomes: mpsc::Sender<ConnectOutcome<P::Link>>,
      reports: mpsc::Sender<SessionReport>,
      read_buffer_size: usize,
   ) -> Self {
      Self {
         platform,
         registry,
         capabilities,
         event_tx,
         outcomes,
         reports,
         read_buffer_size,
         state: ConnectionState::None,
         target: None,
         attempt: None,
         session: None,
         next_id: 0,
      }
   }

   pub const fn state(&self) -> ConnectionState {
      self.state
   }

   pub const fn target(&self) -> Option<Address> {
      self.target
   }

   fn fail(&self, error: SerialError) -> SerialError {
      self.event_tx.emit_error(&error);
      error
   }

   /// Checks that a connect may be issued right now.
   pub async fn preflight(&self) -> Result<()> {
      if !self.capabilities.is_granted(Capability::Connect) {
         return Err(self.fail(SerialError::CapabilityDenied(Capability::Connect)));
      }
      if !self.platform.is_available().await {
         return Err(self.fail(SerialError::AdapterUnavailable));
      }
      Ok(())
   }

   /// Starts a connect attempt to `address`, superseding whatever attempt or
   /// session exists.
   pub fn connect(&mut self, address: Address) -> AttemptId {
      self.release();

      self.next_id += 1;
      let id = AttemptId(self.next_id);
      self.attempt = Some(ConnectWorker::spawn(
         self.platform.clone(),
         id,
         address,
         self.outcomes.clone(),
      ));
      self.transition(ConnectionState::Connecting, Some(address));
      id
   }

   /// Drops the current attempt and session without any notification.
   fn release(&mut self) {
      if let Some(worker) = self.attempt.take() {
         worker.cancel();
      }
      if let Some(session) = self.session.take() {
         session.cancel();
      }
   }

   /// Closes whatever connection exists. Returns whether there was one.
   pub fn disconnect(&mut self) -> bool {
      if self.state == ConnectionState::None {
         return false;
      }
      info!("Disconnecting from {:?}", self.target);
      self.release();
      self.transition(ConnectionState::None, None);
      true
   }

   pub fn handle_outcome(&mut self, outcome: ConnectOutcome<P::Link>) {
      let attempt = outcome.attempt();
      let Some(worker) = self.attempt.take_if(|w| w.id() == attempt) else {
         debug!("Discarding outcome of superseded {attempt}");
         return;
      };
      let address = worker.address();
      drop(worker);

      match outcome {
         ConnectOutcome::Established { link, .. } => {
            info!("Connected to {address} ({attempt})");
            self.transition(ConnectionState::Connected, Some(address));
            self.session = Some(SessionWorker::spawn(
               SessionId(attempt.0),
               address,
               link,
               self.read_buffer_size,
               self.reports.clone(),
            ));
         },
         ConnectOutcome::Failed { error, .. } => {
            warn!("Connect to {address} failed: {error}");
            self.transition(ConnectionState::None, None);
            self
               .event_tx
               .emit_error(&SerialError::ConnectFailed(error.to_string()));
         },
      }
   }

   pub fn handle_report(&mut self, report: SessionReport) {
      match report {
         SessionReport::Received { session, data } => {
            if self.is_current(session) {
               self.event_tx.emit(SerialEvent::DataReceived(data));
            } else {
               debug!("Discarding {} bytes from stale {session}", data.len());
            }
         },
         SessionReport::Disconnected { session, cause } => {
            if !self.is_current(session) {
               debug!("Ignoring disconnect of stale {session}");
               return;
            }
            self.session = None;
            warn!("Connection lost: {cause}");
            self.transition(ConnectionState::None, None);
            self.event_tx.emit(SerialEvent::Error {
               kind: ErrorKind::ConnectionLost,
               detail: cause.to_string(),
            });
         },
      }
   }

   fn is_current(&self, session: SessionId) -> bool {
      self.session.as_ref().is_some_and(|s| s.id() == session)
   }

   /// Write half of the established session.
   pub fn writer(&self) -> Result<SessionWriter> {
      match &self.session {
         Some(session) if self.state == ConnectionState::Connected => Ok(session.writer()),
         _ => Err(SerialError::NotConnected),
      }
   }

   fn transition(&mut self, state: ConnectionState, target: Option<Address>) {
      let previous = mem::replace(&mut self.state, state);
      self.target = target;

      let device = {
         let mut registry = self.registry.lock();
         match (state, target) {
            (ConnectionState::Connected, Some(address)) => {
               registry.mark_connected(address);
            },
            _ => registry.clear_connected(),
         }
         target.map(|address| DeviceLabel {
            address,
            name: registry.name_of(address),
         })
      };

      match &device {
         Some(device) => debug!("Connection state {previous} -> {state} ({device})"),
         None => debug!("Connection state {previous} -> {state}"),
      }
      self
         .event_tx
         .emit(SerialEvent::StateChanged { state, device });
   }
}

#[cfg(test)]
mod tests {
   use std::{io, time::Duration};

   use smol_str::SmolStr;
   use tokio::{
      io::{AsyncReadExt, AsyncWriteExt, DuplexStream},
      time,
   };

   use super::*;
   use crate::{
      bluetooth::{
         mock::{MockPlatform, RecordingBus, addr, establish},
         session::Packet,
      },
      capability::CapabilitySet,
      registry::DeviceRegistry,
   };

   struct Harness {
      manager: ConnectionManager<MockPlatform>,
      platform: Arc<MockPlatform>,
      registry: SharedRegistry,
      caps: Arc<CapabilitySet>,
      bus: Arc<RecordingBus>,
      outcomes: mpsc::Receiver<ConnectOutcome<DuplexStream>>,
      reports: mpsc::Receiver<SessionReport>,
   }

   fn harness() -> Harness {
      let platform = Arc::new(MockPlatform::default());
      let registry = DeviceRegistry::shared();
      let caps = Arc::new(CapabilitySet::new(true, true));
      let bus = Arc::new(RecordingBus::default());
      let (outcome_tx, outcomes) = mpsc::channel(8);
      let (report_tx, reports) = mpsc::channel(8);
      let manager = ConnectionManager::new(
         platform.clone(),
         registry.clone(),
         caps.clone(),
         bus.clone(),
         outcome_tx,
         report_tx,
         1024,
      );
      Harness {
         manager,
         platform,
         registry,
         caps,
         bus,
         outcomes,
         reports,
      }
   }

   impl Harness {
      async fn next_outcome(&mut self) -> ConnectOutcome<DuplexStream> {
         time::timeout(Duration::from_secs(2), self.outcomes.recv())
            .await
            .expect("no outcome")
            .expect("outcome channel closed")
      }

      async fn next_report(&mut self) -> SessionReport {
         time::timeout(Duration::from_secs(2), self.reports.recv())
            .await
            .expect("no report")
            .expect("report channel closed")
      }

      /// Connects to `address` and drives the attempt to an established session.
      async fn connected(&mut self, address: Address) -> DuplexStream {
         self.manager.connect(address);
         let remote = establish(self.platform.next_open(address).await);
         let outcome = self.next_outcome().await;
         self.manager.handle_outcome(outcome);
         assert_eq!(self.manager.state(), ConnectionState::Connected);
         remote
      }

      fn states(&self) -> Vec<ConnectionState> {
         self
            .bus
            .events()
            .into_iter()
            .filter_map(|e| match e {
               SerialEvent::StateChanged { state, .. } => Some(state),
               _ => None,
            })
            .collect()
      }

      fn errors(&self) -> Vec<ErrorKind> {
         self
            .bus
            .events()
            .into_iter()
            .filter_map(|e| match e {
               SerialEvent::Error { kind, .. } => Some(kind),
               _ => None,
            })
            .collect()
      }
   }

   #[tokio::test]
   async fn test_connect_success() {
      let mut h = harness();
      h.registry
         .lock()
         .upsert_discovered(addr(1), Some(SmolStr::new("HC-05")));

      let _remote = h.connected(addr(1)).await;

      assert_eq!(h.states(), vec![ConnectionState::Connecting, ConnectionState::Connected]);
      assert_eq!(
         h.bus.events().last(),
         Some(&SerialEvent::StateChanged {
            state: ConnectionState::Connected,
            device: Some(DeviceLabel {
               address: addr(1),
               name: Some(SmolStr::new("HC-05")),
            }),
         })
      );
      assert!(h.registry.lock().get(addr(1)).is_some_and(|e| e.connected));
   }

   #[tokio::test]
   async fn test_newer_connect_supersedes_attempt() {
      let mut h = harness();
      h.manager.connect(addr(1));
      let mut stale = h.platform.next_open(addr(1)).await;

      h.manager.connect(addr(2));
      time::timeout(Duration::from_secs(2), stale.closed())
         .await
         .expect("superseded attempt was not cancelled");

      let remote = establish(h.platform.next_open(addr(2)).await);
      let outcome = h.next_outcome().await;
      assert_eq!(outcome.attempt(), AttemptId(2));
      h.manager.handle_outcome(outcome);

      assert_eq!(h.manager.state(), ConnectionState::Connected);
      assert_eq!(h.manager.target(), Some(addr(2)));
      assert!(h.errors().is_empty());
      drop(remote);
   }

   #[tokio::test]
   async fn test_stale_outcome_is_closed_and_ignored() {
      let mut h = harness();
      h.manager.connect(addr(1));
      let mut remote_a = establish(h.platform.next_open(addr(1)).await);
      let outcome_a = h.next_outcome().await;

      // A newer attempt was issued before the first outcome was handled.
      h.manager.connect(addr(2));
      h.manager.handle_outcome(outcome_a);
      assert_eq!(h.manager.state(), ConnectionState::Connecting);
      assert_eq!(h.manager.target(), Some(addr(2)));

      let mut buf = [0u8; 1];
      let n = time::timeout(Duration::from_secs(2), remote_a.read(&mut buf))
         .await
         .unwrap()
         .unwrap();
      assert_eq!(n, 0);
      assert!(!h.states().contains(&ConnectionState::Connected));
   }

   #[tokio::test]
   async fn test_reconnect_to_same_address_discards_first_attempt() {
      let mut h = harness();
      h.manager.connect(addr(1));
      let mut remote_a = establish(h.platform.next_open(addr(1)).await);
      let outcome_a = h.next_outcome().await;

      let second = h.manager.connect(addr(1));
      h.manager.handle_outcome(outcome_a);
      assert_eq!(h.manager.state(), ConnectionState::Connecting);
      assert_eq!(h.manager.target(), Some(addr(1)));

      let mut buf = [0u8; 1];
      let n = time::timeout(Duration::from_secs(2), remote_a.read(&mut buf))
         .await
         .unwrap()
         .unwrap();
      assert_eq!(n, 0);

      let _remote_b = establish(h.platform.next_open(addr(1)).await);
      let outcome_b = h.next_outcome().await;
      assert_eq!(outcome_b.attempt(), second);
      h.manager.handle_outcome(outcome_b);

      assert_eq!(h.manager.state(), ConnectionState::Connected);
      assert_eq!(
         h.states(),
         vec![
            ConnectionState::Connecting,
            ConnectionState::Connecting,
            ConnectionState::Connected
         ]
      );
      assert!(h.errors().is_empty());
   }

   #[tokio::test]
   async fn test_connect_while_connected_closes_old_session() {
      let mut h = harness();
      let mut remote_a = h.connected(addr(1)).await;
      h.bus.take();

      h.manager.connect(addr(2));
      assert_eq!(h.states(), vec![ConnectionState::Connecting]);

      let mut buf = [0u8; 1];
      let n = time::timeout(Duration::from_secs(2), remote_a.read(&mut buf))
         .await
         .unwrap()
         .unwrap();
      assert_eq!(n, 0);
      assert!(h.errors().is_empty());
   }

   #[tokio::test]
   async fn test_connect_failure() {
      let mut h = harness();
      h.manager.connect(addr(1));
      let reply = h.platform.next_open(addr(1)).await;
      let _ = reply.send(Err(io::Error::new(io::ErrorKind::HostUnreachable, "page timeout")));
      let outcome = h.next_outcome().await;
      h.manager.handle_outcome(outcome);

      assert_eq!(h.manager.state(), ConnectionState::None);
      assert_eq!(h.states(), vec![ConnectionState::Connecting, ConnectionState::None]);
      assert_eq!(h.errors(), vec![ErrorKind::ConnectFailed]);
   }

   #[tokio::test]
   async fn test_data_and_single_connection_lost() {
      let mut h = harness();
      let mut remote = h.connected(addr(1)).await;

      remote.write_all(b"OK\r\n").await.unwrap();
      match h.next_report().await {
         report @ SessionReport::Received { .. } => h.manager.handle_report(report),
         other => panic!("unexpected report: {other:?}"),
      }
      assert!(
         h.bus
            .events()
            .contains(&SerialEvent::DataReceived(Packet::from_slice(b"OK\r\n")))
      );

      drop(remote);
      let report = h.next_report().await;
      assert!(matches!(report, SessionReport::Disconnected { .. }));
      h.manager.handle_report(report);

      // A write racing the failure reports through its result only.
      assert!(matches!(h.manager.writer(), Err(SerialError::NotConnected)));

      assert_eq!(h.manager.state(), ConnectionState::None);
      assert_eq!(h.errors(), vec![ErrorKind::ConnectionLost]);
      assert!(!h.registry.lock().entries().any(|e| e.connected));
   }

   #[tokio::test]
   async fn test_write_and_read_failure_report_once() {
      let mut h = harness();
      let remote = h.connected(addr(1)).await;
      drop(remote);

      let writer = h.manager.writer().unwrap();
      assert!(writer.write(Packet::from_slice(b"x")).await.is_err());

      // Both directions may have reported by now.
      while let Ok(Some(report)) =
         time::timeout(Duration::from_millis(100), h.reports.recv()).await
      {
         h.manager.handle_report(report);
      }

      assert_eq!(h.errors(), vec![ErrorKind::ConnectionLost]);
      assert_eq!(
         h.states(),
         vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::None
         ]
      );
   }

   #[tokio::test]
   async fn test_write_reaches_remote() {
      let mut h = harness();
      let mut remote = h.connected(addr(1)).await;

      let writer = h.manager.writer().unwrap();
      writer.write(Packet::from_slice(b"AT")).await.unwrap();

      let mut buf = [0u8; 2];
      remote.read_exact(&mut buf).await.unwrap();
      assert_eq!(&buf, b"AT");
   }

   #[tokio::test]
   async fn test_write_requires_connection() {
      let mut h = harness();
      assert!(matches!(h.manager.writer(), Err(SerialError::NotConnected)));

      h.manager.connect(addr(1));
      assert!(matches!(h.manager.writer(), Err(SerialError::NotConnected)));
   }

   #[tokio::test]
   async fn test_preflight_denials() {
      let h = harness();
      h.caps.set(Capability::Connect, false);
      assert!(matches!(
         h.manager.preflight().await,
         Err(SerialError::CapabilityDenied(Capability::Connect))
      ));

      h.caps.set(Capability::Connect, true);
      h.platform.set_available(false);
      assert!(matches!(
         h.manager.preflight().await,
         Err(SerialError::AdapterUnavailable)
      ));
      assert_eq!(
         h.errors(),
         vec![ErrorKind::CapabilityDenied, ErrorKind::AdapterUnavailable]
      );
      assert!(h.states().is_empty());
   }

   #[tokio::test]
   async fn test_disconnect() {
      let mut h = harness();
      assert!(!h.manager.disconnect());

      let mut remote = h.connected(addr(1)).await;
      assert!(h.manager.disconnect());
      assert_eq!(h.manager.state(), ConnectionState::None);
      assert_eq!(h.manager.target(), None);

      let mut buf = [0u8; 1];
      let n = time::timeout(Duration::from_secs(2), remote.read(&mut buf))
         .await
         .unwrap()
         .unwrap();
      assert_eq!(n, 0);

      assert!(h.errors().is_empty());
      assert_eq!(h.states().last(), Some(&ConnectionState::None));
   }
}
