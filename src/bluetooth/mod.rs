//! Bluetooth layer of the serial link service.
//!
//! The platform seam and its BlueZ implementation, the discovery and
//! connection state machines, the connect and session workers, and the
//! manager actor that serializes all of them.

pub mod bluez;
pub mod connect;
pub mod connection;
pub mod discovery;
pub mod manager;
pub mod platform;
pub mod session;

#[cfg(test)]
mod mock;
