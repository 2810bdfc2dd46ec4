//! Ordered, deduplicated registry of remote devices.
//!
//! The registry keeps two sections: devices the adapter is bonded with and
//! devices seen during discovery. An address lives in at most one section,
//! and the paired section wins when a device shows up in both. Within a
//! section entries keep their insertion order.

use std::{collections::HashSet, mem, sync::Arc};

use bluer::Address;
use parking_lot::Mutex;
use serde_json::json;
use smol_str::SmolStr;

/// Registry shared between the discovery and connection halves of the manager.
pub type SharedRegistry = Arc<Mutex<DeviceRegistry>>;

/// Section a device entry is rendered in.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   strum::Display,
   strum::IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
pub enum Section {
   Paired,
   Discovered,
}

impl Section {
   pub fn to_str(self) -> &'static str {
      self.into()
   }
}

/// A known remote device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEntry {
   pub address: Address,
   pub name: Option<SmolStr>,
   pub section: Section,
   pub connected: bool,
}

impl DeviceEntry {
   const fn new(address: Address, name: Option<SmolStr>, section: Section) -> Self {
      Self {
         address,
         name,
         section,
         connected: false,
      }
   }

   pub fn to_json(&self) -> serde_json::Value {
      json!({
         "address": self.address.to_string(),
         "name": self.name.as_deref(),
         "section": self.section.to_str(),
         "connected": self.connected,
      })
   }
}

/// Result of merging a discovered device into the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
   /// A new entry was appended to the discovered section.
   Added,
   /// An existing entry gained or changed its display name.
   Updated,
   /// Nothing changed.
   Ignored,
}

impl UpsertOutcome {
   pub const fn is_changed(self) -> bool {
      matches!(self, Self::Added | Self::Updated)
   }
}

/// One rendered row of the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryRow {
   Header(Section),
   Device(DeviceEntry),
   /// The section finished populating and is empty.
   Placeholder(Section),
}

impl RegistryRow {
   pub const fn is_device(&self) -> bool {
      matches!(self, Self::Device(_))
   }

   pub fn to_json(&self) -> serde_json::Value {
      match self {
         Self::Header(section) => json!({ "kind": "header", "section": section.to_str() }),
         Self::Device(entry) => {
            let mut value = entry.to_json();
            value["kind"] = json!("device");
            value
         },
         Self::Placeholder(section) => {
            json!({ "kind": "placeholder", "section": section.to_str() })
         },
      }
   }
}

/// Renders a snapshot as a JSON array.
pub fn rows_to_json(rows: &[RegistryRow]) -> serde_json::Value {
   serde_json::Value::Array(rows.iter().map(RegistryRow::to_json).collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Population {
   #[default]
   Pending,
   InProgress,
   Complete,
}

#[derive(Debug, Default)]
pub struct DeviceRegistry {
   paired: Vec<DeviceEntry>,
   discovered: Vec<DeviceEntry>,
   paired_loaded: bool,
   discovery: Population,
   connected: Option<Address>,
}

fn normalize(name: Option<SmolStr>) -> Option<SmolStr> {
   name.filter(|n| !n.trim().is_empty())
}

impl DeviceRegistry {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn shared() -> SharedRegistry {
      Arc::new(Mutex::new(Self::new()))
   }

   /// Replaces the paired section with `devices`, in the given order.
   ///
   /// Discovered entries for the same addresses are dropped. Names are never
   /// downgraded: a device listed without a name keeps the one it had.
   pub fn upsert_paired<I>(&mut self, devices: I) -> Vec<RegistryRow>
   where
      I: IntoIterator<Item = (Address, Option<SmolStr>)>,
   {
      let previous = mem::take(&mut self.paired);
      let mut seen = HashSet::new();

      for (address, name) in devices {
         if !seen.insert(address) {
            continue;
         }
         let prior = previous
            .iter()
            .chain(self.discovered.iter())
            .find(|e| e.address == address);
         let name = normalize(name).or_else(|| prior.and_then(|e| e.name.clone()));
         let mut entry = DeviceEntry::new(address, name, Section::Paired);
         entry.connected = self.connected == Some(address);
         self.paired.push(entry);
      }

      self.discovered.retain(|e| !seen.contains(&e.address));
      self.paired_loaded = true;
      self.snapshot()
   }

   /// Merges a device seen during discovery.
   pub fn upsert_discovered(&mut self, address: Address, name: Option<SmolStr>) -> UpsertOutcome {
      let name = normalize(name);

      if let Some(entry) = self.entry_mut(address) {
         return match name {
            Some(name) if entry.name.as_ref() != Some(&name) => {
               entry.name = Some(name);
               UpsertOutcome::Updated
            },
            _ => UpsertOutcome::Ignored,
         };
      }

      let mut entry = DeviceEntry::new(address, name, Section::Discovered);
      entry.connected = self.connected == Some(address);
      self.discovered.push(entry);
      UpsertOutcome::Added
   }

   /// Flags `address` as the connected device, clearing any other flag.
   ///
   /// The flag sticks to the address, so an entry added for it later comes
   /// back flagged. Returns whether an entry exists right now.
   pub fn mark_connected(&mut self, address: Address) -> bool {
      self.clear_connected();
      self.connected = Some(address);
      match self.entry_mut(address) {
         Some(entry) => {
            entry.connected = true;
            true
         },
         None => false,
      }
   }

   pub fn clear_connected(&mut self) {
      self.connected = None;
      for entry in self.paired.iter_mut().chain(self.discovered.iter_mut()) {
         entry.connected = false;
      }
   }

   /// Drops every discovered entry ahead of a fresh discovery round.
   pub fn clear_discovered(&mut self) {
      self.discovered.clear();
      self.discovery = Population::InProgress;
   }

   /// Marks the current discovery round as finished.
   pub fn finish_discovery(&mut self) {
      self.discovery = Population::Complete;
   }

   pub fn get(&self, address: Address) -> Option<&DeviceEntry> {
      self
         .paired
         .iter()
         .chain(self.discovered.iter())
         .find(|e| e.address == address)
   }

   fn entry_mut(&mut self, address: Address) -> Option<&mut DeviceEntry> {
      self
         .paired
         .iter_mut()
         .chain(self.discovered.iter_mut())
         .find(|e| e.address == address)
   }

   pub fn name_of(&self, address: Address) -> Option<SmolStr> {
      self.get(address).and_then(|e| e.name.clone())
   }

   /// All entries, paired first.
   pub fn entries(&self) -> impl Iterator<Item = &DeviceEntry> {
      self.paired.iter().chain(self.discovered.iter())
   }

   /// Number of real device entries across both sections.
   pub fn device_count(&self) -> usize {
      self.paired.len() + self.discovered.len()
   }

   /// Ordered rows for rendering.
   pub fn snapshot(&self) -> Vec<RegistryRow> {
      let mut rows = Vec::with_capacity(self.device_count() + 4);

      if self.paired_loaded || !self.paired.is_empty() {
         rows.push(RegistryRow::Header(Section::Paired));
         rows.extend(self.paired.iter().cloned().map(RegistryRow::Device));
         if self.paired.is_empty() {
            rows.push(RegistryRow::Placeholder(Section::Paired));
         }
      }

      if self.discovery != Population::Pending || !self.discovered.is_empty() {
         rows.push(RegistryRow::Header(Section::Discovered));
         rows.extend(self.discovered.iter().cloned().map(RegistryRow::Device));
         if self.discovered.is_empty() && self.discovery == Population::Complete {
            rows.push(RegistryRow::Placeholder(Section::Discovered));
         }
      }

      rows
   }
}
