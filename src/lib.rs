//! Classic Bluetooth serial (SPP) link service.
//!
//! Discovers nearby BR/EDR devices, keeps a registry of paired and
//! discovered devices, and maintains at most one RFCOMM serial connection
//! at a time. Progress is reported through an ordered event stream.

pub mod bluetooth;
pub mod capability;
pub mod config;
pub mod dbus;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod registry;
