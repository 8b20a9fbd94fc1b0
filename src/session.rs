//! Seams to the collaborators this crate drives but does not implement.
//!
//! The device protocol (framing, encryption handshake, field decoding) lives
//! in an external library and is reached through [`DeviceSession`],
//! [`DeviceRecognizer`] and [`DeviceCatalog`]. Device presence comes from the
//! host's Bluetooth stack through [`Presence`]; see
//! [`AdvertisementMonitor`](crate::AdvertisementMonitor) for a `bluest`
//! backed implementation.

use std::time::Duration;

use async_trait::async_trait;

use crate::field::FieldMap;
use crate::field::FieldValue;
use crate::field::SelectField;

/// A connection to one physical device.
///
/// Only ever used through an [`AccessLock`](crate::AccessLock) guard, so
/// implementations can assume calls never overlap.
#[async_trait]
pub trait DeviceSession: Send {
    async fn connect(&mut self) -> anyhow::Result<()>;

    async fn disconnect(&mut self) -> anyhow::Result<()>;

    fn is_connected(&self) -> bool;

    /// Read and decode every field the device reports.
    ///
    /// `timeout` bounds each request; failed requests are retried up to
    /// `max_retries` times before giving up.
    async fn read(&mut self, timeout: Duration, max_retries: u32) -> anyhow::Result<FieldMap>;

    async fn write(&mut self, field: &str, value: &FieldValue, timeout: Duration) -> anyhow::Result<()>;
}

/// The host's view of which devices are currently advertising
#[async_trait]
pub trait Presence: Send + Sync {
    async fn is_reachable(&self, address: &str) -> bool;
}

/// What the protocol library knows about a discovered device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recognition {
    pub device_type: String,
    pub requires_encryption: bool,
}

#[async_trait]
pub trait DeviceRecognizer: Send + Sync {
    /// Returns `None` if the device is not a supported model.
    async fn recognize_device(&self, address: &str, name: &str) -> anyhow::Result<Option<Recognition>>;
}

/// The fields a device model exposes, grouped by entity platform
pub trait DeviceCatalog: Send + Sync {
    fn sensor_fields(&self) -> Vec<String>;
    fn bool_fields(&self) -> Vec<String>;
    fn switch_fields(&self) -> Vec<String>;
    fn select_fields(&self) -> Vec<SelectField>;
}
