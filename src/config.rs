//! Configuration management for the serial port service.
//!
//! This module handles loading and saving configuration from disk,
//! including adapter selection, initial capability grants and transport
//! parameters.

use std::{
   env, fs,
   path::{Path, PathBuf},
   time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SerialError};

/// Main configuration structure for the service.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Config {
   /// Adapter to use; the system default adapter when absent.
   #[serde(default)]
   pub adapter: Option<String>,

   #[serde(default = "default_allowed")]
   pub allow_scan: bool,

   #[serde(default = "default_allowed")]
   pub allow_connect: bool,

   #[serde(default = "default_read_buffer_size")]
   pub read_buffer_size: usize,

   #[serde(default = "default_scan_window")]
   pub scan_window_sec: u64,

   /// Fixed RFCOMM channel; the SPP service record is used when absent.
   #[serde(default)]
   pub rfcomm_channel: Option<u8>,
}

const fn default_allowed() -> bool {
   true
}

const fn default_read_buffer_size() -> usize {
   1024
}

const fn default_scan_window() -> u64 {
   12
}

impl Default for Config {
   fn default() -> Self {
      Self {
         adapter: None,
         allow_scan: default_allowed(),
         allow_connect: default_allowed(),
         read_buffer_size: default_read_buffer_size(),
         scan_window_sec: default_scan_window(),
         rfcomm_channel: None,
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      self.save_to(&Self::config_path()?)
   }

   pub fn load_from(path: &Path) -> Result<Self> {
      if path.exists() {
         let contents = fs::read_to_string(path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save_to(path)?;
         Ok(config)
      }
   }

   pub fn save_to(&self, path: &Path) -> Result<()> {
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      if let Ok(home) = env::var("SPPD_HOME") {
         return Ok(PathBuf::from(home).join("config.toml"));
      }
      let config_dir = dirs::config_dir().ok_or(SerialError::ConfigDirNotFound)?;
      Ok(config_dir.join("sppd").join("config.toml"))
   }

   pub const fn scan_window(&self) -> Duration {
      Duration::from_secs(self.scan_window_sec)
   }

   /// Read buffer size, never zero.
   pub fn read_buffer_size(&self) -> usize {
      self.read_buffer_size.max(1)
   }
}
