//! Serial port profile daemon.
//!
//! Exposes Bluetooth SPP discovery and a single serial connection over
//! D-Bus, backed by BlueZ.

use std::{sync::Arc, time::Duration};

use log::{info, warn};
use tokio::{signal, time};
use zbus::connection;

use sppd::{
   bluetooth::{bluez::BluezPlatform, manager::BluetoothManager},
   capability::CapabilitySet,
   config::Config,
   dbus::{self, SerialService},
   dispatch::EventDispatcher,
   error::Result,
};

/// How long to wait for the final events to reach D-Bus on exit
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting sppd...");

   let config = Config::load()?;
   let capabilities = Arc::new(CapabilitySet::new(config.allow_scan, config.allow_connect));

   let event_bus = EventDispatcher::new();
   let platform = Arc::new(BluezPlatform::new(&config).await?);
   let manager =
      BluetoothManager::new(platform, &config, capabilities.clone(), event_bus.clone());

   match manager.refresh_paired().await {
      Ok(rows) => info!("Loaded {} paired devices", rows.iter().filter(|r| r.is_device()).count()),
      Err(e) => warn!("Could not load paired devices: {e}"),
   }

   let service = SerialService::new(manager.clone(), capabilities);
   let connection = connection::Builder::session()?
      .name(dbus::SERVICE_NAME)?
      .serve_at(dbus::OBJECT_PATH, service)?
      .build()
      .await?;

   info!("sppd D-Bus service started at {}", dbus::SERVICE_NAME);

   let forwarder = dbus::forward_events(event_bus, &connection).await?;

   signal::ctrl_c().await?;
   info!("Shutting down sppd...");

   manager.shutdown().await;
   if time::timeout(FLUSH_TIMEOUT, forwarder).await.is_err() {
      warn!("Gave up delivering pending events");
   }

   Ok(())
}
