//! Poll and control Bluetti power stations over Bluetooth Low Energy
//!
//! The device protocol (framing, encryption handshake, field decoding) is provided
//! by an external library behind the [`DeviceSession`] trait. This crate is the
//! coordination layer on top of it:
//!
//! - A [`PollingCoordinator`] reads every field on a fixed interval and publishes
//!   either a [`FieldMap`] or a failure to all subscribers.
//! - A [`CommandDispatcher`] writes switch and select changes, waits for the device
//!   to settle and then asks the coordinator for an extra read.
//! - Both go through one [`AccessLock`] per device, so at most one read or write is
//!   ever in flight on the BLE link.
//! - Each [`Entity`] counts missed updates and becomes unavailable after five in a
//!   row, recovering on the next good read.
//!
//! Device presence is checked before every read. [`AdvertisementMonitor`] answers
//! that from a background scan using the `bluest` crate.
//!
//! # Example
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use std::time::Duration;
//! # use bluetti_bt::*;
//! # async fn example(entry: ConfigEntry, session: Box<dyn DeviceSession>, catalog: Arc<dyn DeviceCatalog>) -> anyhow::Result<()> {
//! let presence = Arc::new(AdvertisementMonitor::start(AdvertisementMonitor::DEFAULT_WINDOW).await?);
//! let context = IntegrationContext::setup(entry, Collaborators { session, presence, catalog }).await?;
//!
//! let entities = context.entities();
//! for entity in &entities {
//!     println!("{} = {:?}", entity.descriptor().unique_id, entity.state());
//! }
//!
//! context
//!     .dispatcher()
//!     .execute(&WriteRequest::new("ac_output", FieldValue::Bool(true)))
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod availability;
mod config;
mod context;
mod coordinator;
mod dispatcher;
mod entity;
mod error;
mod field;
mod lock;
mod presence;
mod session;
mod util;

#[cfg(test)]
mod mock;

pub use availability::{AvailabilityState, AvailabilityTracker, TickOutcome, UNAVAILABLE_THRESHOLD};
pub use config::{ConfigEntry, DeviceConfig, DeviceIdentity, OperationalParams, OptionsUpdate};
pub use context::{Collaborators, IntegrationContext};
pub use coordinator::{CoordinatorState, CoordinatorUpdate, PollingCoordinator, RefreshTrigger};
pub use dispatcher::{CommandDispatcher, WriteRequest, SETTLE_DELAY};
pub use entity::{build_entities, DeviceInfo, Entity, EntityDescriptor, EntityHandle, EntityState, Staleness, DOMAIN, MANUFACTURER};
pub use error::{ConfigError, ReadFailure, RejectReason, SetupError, WriteError, WriteFailure};
pub use field::{FieldCatalog, FieldKind, FieldMap, FieldSpec, FieldValue, SelectField};
pub use lock::{AccessGuard, AccessLock};
pub use presence::AdvertisementMonitor;
pub use session::{DeviceCatalog, DeviceRecognizer, DeviceSession, Presence, Recognition};
pub use util::{mask_address, unique_id};
