//! Runtime capability gates.
//!
//! Permission acquisition happens outside this service. The collaborator that
//! owns it reports the outcome as a set of flags, and the core checks those
//! flags before any operation that needs them.

use std::sync::atomic::{AtomicBool, Ordering};

/// Capabilities some operations require before they may proceed.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
pub enum Capability {
   /// Starting a discovery round.
   Scan,
   /// Opening connections, listing bonded devices and resolving names.
   Connect,
}

/// Answers whether a capability is currently granted.
pub trait CapabilityGate: Send + Sync {
   fn is_granted(&self, capability: Capability) -> bool;
}

/// Capability flags updated by the permission collaborator.
#[derive(Debug, Default)]
pub struct CapabilitySet {
   scan: AtomicBool,
   connect: AtomicBool,
}

impl CapabilitySet {
   pub const fn new(scan: bool, connect: bool) -> Self {
      Self {
         scan: AtomicBool::new(scan),
         connect: AtomicBool::new(connect),
      }
   }

   const fn flag(&self, capability: Capability) -> &AtomicBool {
      match capability {
         Capability::Scan => &self.scan,
         Capability::Connect => &self.connect,
      }
   }

   /// Records a grant or revocation, returning the previous value.
   pub fn set(&self, capability: Capability, granted: bool) -> bool {
      self.flag(capability).swap(granted, Ordering::AcqRel)
   }
}

impl CapabilityGate for CapabilitySet {
   fn is_granted(&self, capability: Capability) -> bool {
      self.flag(capability).load(Ordering::Acquire)
   }
}
