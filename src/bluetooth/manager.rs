//! Serial link manager.
//!
//! All state changes happen on a single actor task. Public calls, platform
//! events, connect outcomes and session reports are all funnelled into its
//! `select!` loop, so discovery and connection handling never run
//! concurrently with each other.

use std::sync::Arc;

use bluer::Address;
use log::{debug, info, warn};
use tokio::{
   select,
   sync::{mpsc, oneshot},
   task::JoinHandle,
};

use crate::{
   bluetooth::{
      connect::ConnectOutcome,
      connection::ConnectionManager,
      discovery::DiscoveryController,
      platform::{Platform, PlatformEvent},
      session::{Packet, SessionReport, SessionWriter},
   },
   capability::CapabilityGate,
   config::Config,
   error::{Result, SerialError},
   event::{ConnectionState, EventSender},
   registry::{DeviceRegistry, RegistryRow, SharedRegistry},
};

/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 256;

// === Commands ===

#[derive(Debug)]
enum ManagerCommand {
   StartScan(oneshot::Sender<Result<()>>),
   CancelScan(oneshot::Sender<bool>),
   RefreshPaired(oneshot::Sender<Result<Vec<RegistryRow>>>),
   Connect(Address, oneshot::Sender<Result<()>>),
   Disconnect(oneshot::Sender<bool>),
   Writer(oneshot::Sender<Result<SessionWriter>>),
   State(oneshot::Sender<(ConnectionState, Option<Address>)>),
   Shutdown(oneshot::Sender<()>),
}

// === Main Manager ===

/// Handle to the manager actor.
///
/// Cheap to clone. Every call is serialized through the actor; discovery and
/// connection progress is reported on the event bus given at construction.
#[derive(Clone)]
pub struct BluetoothManager {
   inbox: mpsc::Sender<ManagerCommand>,
   registry: SharedRegistry,
}

impl BluetoothManager {
   pub fn new<P: Platform>(
      platform: Arc<P>,
      config: &Config,
      capabilities: Arc<dyn CapabilityGate>,
      event_tx: EventSender,
   ) -> Self {
      let registry = DeviceRegistry::shared();
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let actor = ManagerActor::new(
         platform,
         registry.clone(),
         capabilities,
         event_tx,
         command_rx,
         config.read_buffer_size(),
      );
      tokio::spawn(actor.run());
      Self {
         inbox: command_tx,
         registry,
      }
   }

   async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> ManagerCommand) -> Result<T> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(make(tx))
         .await
         .map_err(|_| SerialError::ManagerShutdown)?;
      rx.await.map_err(|_| SerialError::ManagerShutdown)
   }

   /// Starts a discovery round, restarting any round in progress.
   pub async fn start_scan(&self) -> Result<()> {
      self.request(ManagerCommand::StartScan).await?
   }

   /// Stops the running discovery round. Returns whether one was running.
   pub async fn cancel_scan(&self) -> Result<bool> {
      self.request(ManagerCommand::CancelScan).await
   }

   /// Reloads the paired section from the adapter.
   pub async fn refresh_paired(&self) -> Result<Vec<RegistryRow>> {
      self.request(ManagerCommand::RefreshPaired).await?
   }

   /// Begins connecting to `address`. Completion is reported through
   /// `StateChanged` events.
   pub async fn connect(&self, address: Address) -> Result<()> {
      self
         .request(|tx| ManagerCommand::Connect(address, tx))
         .await?
   }

   pub async fn disconnect(&self) -> Result<bool> {
      self.request(ManagerCommand::Disconnect).await
   }

   /// Writes `data` to the connected device, resolving once the write has
   /// been performed.
   ///
   /// Only the session lookup goes through the actor; queueing and the write
   /// itself happen on the caller's task.
   pub async fn write(&self, data: &[u8]) -> Result<()> {
      let writer = self.request(ManagerCommand::Writer).await??;
      writer.write(Packet::from_slice(data)).await
   }

   pub async fn state(&self) -> Result<(ConnectionState, Option<Address>)> {
      self.request(ManagerCommand::State).await
   }

   /// Current registry rows for rendering.
   pub fn snapshot(&self) -> Vec<RegistryRow> {
      self.registry.lock().snapshot()
   }

   /// Cancels discovery, closes any connection and stops the actor.
   pub async fn shutdown(&self) {
      if self.request(ManagerCommand::Shutdown).await.is_err() {
         debug!("Manager already stopped");
      }
   }
}

// === Manager Actor ===

struct ManagerActor<P: Platform> {
   platform: Arc<P>,
   command_rx: mpsc::Receiver<ManagerCommand>,
   platform_rx: mpsc::Receiver<PlatformEvent>,
   platform_tx: mpsc::Sender<PlatformEvent>,
   outcome_rx: mpsc::Receiver<ConnectOutcome<P::Link>>,
   report_rx: mpsc::Receiver<SessionReport>,

   discovery: DiscoveryController<P>,
   connection: ConnectionManager<P>,
   bond_watch: Option<JoinHandle<()>>,
}

impl<P: Platform> ManagerActor<P> {
   fn new(
      platform: Arc<P>,
      registry: SharedRegistry,
      capabilities: Arc<dyn CapabilityGate>,
      event_tx: EventSender,
      command_rx: mpsc::Receiver<ManagerCommand>,
      read_buffer_size: usize,
   ) -> Self {
      let (platform_tx, platform_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let (outcome_tx, outcome_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let (report_tx, report_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);

      let discovery = DiscoveryController::new(
         platform.clone(),
         registry.clone(),
         capabilities.clone(),
         event_tx.clone(),
         platform_tx.clone(),
      );
      let connection = ConnectionManager::new(
         platform.clone(),
         registry,
         capabilities,
         event_tx,
         outcome_tx,
         report_tx,
         read_buffer_size,
      );

      Self {
         platform,
         command_rx,
         platform_rx,
         platform_tx,
         outcome_rx,
         report_rx,
         discovery,
         connection,
         bond_watch: None,
      }
   }

   async fn run(mut self) {
      info!("Serial link manager starting up");

      match self.platform.watch_bonds(self.platform_tx.clone()).await {
         Ok(handle) => self.bond_watch = Some(handle),
         Err(e) => warn!("Bond changes will not be tracked: {e}"),
      }

      // Main event loop
      loop {
         select! {
             cmd = self.command_rx.recv() => {
                 let Some(cmd) = cmd else {
                     info!("All manager handles dropped, shutting down");
                     self.cleanup();
                     break;
                 };
                 if !self.handle_command(cmd).await {
                     break;
                 }
             }
             Some(event) = self.platform_rx.recv() => {
                 self.discovery.handle_event(event).await;
             }
             Some(outcome) = self.outcome_rx.recv() => {
                 self.connection.handle_outcome(outcome);
             }
             Some(report) = self.report_rx.recv() => {
                 self.connection.handle_report(report);
             }
         }
      }
   }

   /// Returns `false` once the actor should stop.
   async fn handle_command(&mut self, cmd: ManagerCommand) -> bool {
      match cmd {
         ManagerCommand::StartScan(reply) => {
            let result = self.discovery.start_scan().await.map(|_| ());
            let _ = reply.send(result);
         },
         ManagerCommand::CancelScan(reply) => {
            let _ = reply.send(self.discovery.cancel_scan());
         },
         ManagerCommand::RefreshPaired(reply) => {
            let _ = reply.send(self.discovery.refresh_paired().await);
         },
         ManagerCommand::Connect(address, reply) => {
            let _ = reply.send(self.handle_connect(address).await);
         },
         ManagerCommand::Disconnect(reply) => {
            let _ = reply.send(self.connection.disconnect());
         },
         ManagerCommand::Writer(reply) => {
            let _ = reply.send(self.connection.writer());
         },
         ManagerCommand::State(reply) => {
            let _ = reply.send((self.connection.state(), self.connection.target()));
         },
         ManagerCommand::Shutdown(reply) => {
            self.cleanup();
            let _ = reply.send(());
            return false;
         },
      }
      true
   }

   async fn handle_connect(&mut self, address: Address) -> Result<()> {
      self.connection.preflight().await?;
      if self.discovery.cancel_scan() {
         debug!("Discovery stopped ahead of connecting to {address}");
      }
      self.connection.connect(address);
      Ok(())
   }

   fn cleanup(&mut self) {
      info!("Cleaning up serial link manager");
      self.discovery.cancel_scan();
      self.connection.disconnect();
      if let Some(handle) = self.bond_watch.take() {
         handle.abort();
      }
   }
}
