//! Per-field entities fed by the polling coordinator.
//!
//! An [`Entity`] is a plain state machine: it turns coordinator updates into
//! a value plus availability. An [`EntityHandle`] runs one entity as a
//! subscriber task and forwards writes to the [`CommandDispatcher`].

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::warn;

use crate::availability::AvailabilityState;
use crate::availability::UNAVAILABLE_THRESHOLD;
use crate::availability::TickOutcome;
use crate::config::DeviceIdentity;
use crate::coordinator::CoordinatorUpdate;
use crate::coordinator::PollingCoordinator;
use crate::dispatcher::CommandDispatcher;
use crate::dispatcher::WriteRequest;
use crate::error::RejectReason;
use crate::error::WriteError;
use crate::field::FieldCatalog;
use crate::field::FieldKind;
use crate::field::FieldSpec;
use crate::field::FieldValue;
use crate::util::unique_id;

pub const DOMAIN: &str = "bluetti_bt";
pub const MANUFACTURER: &str = "Bluetti";

/// The physical device every entity of one config entry belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// `(domain, address)`, stable across renames
    pub identifiers: (String, String),
    pub name: String,
    pub manufacturer: String,
    pub model: String,
}

impl From<&DeviceIdentity> for DeviceInfo {
    fn from(identity: &DeviceIdentity) -> Self {
        Self {
            identifiers: (DOMAIN.to_string(), identity.address.clone()),
            name: identity.name.clone(),
            manufacturer: MANUFACTURER.to_string(),
            model: identity.dev_type.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDescriptor {
    pub unique_id: String,
    pub field: String,
    pub kind: FieldKind,
    pub options: Vec<String>,
    pub device: DeviceInfo,
}

impl EntityDescriptor {
    pub fn new(device: DeviceInfo, spec: &FieldSpec) -> Self {
        Self {
            unique_id: unique_id(&format!("{} {}", device.name, spec.name), Some(spec.kind.platform())),
            field: spec.name.clone(),
            kind: spec.kind,
            options: spec.options.clone(),
            device,
        }
    }
}

/// Why an entity's value may be out of date
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Staleness {
    pub missed: u32,
    pub cause: String,
}

/// What an entity shows right now
#[derive(Debug, Clone, PartialEq)]
pub struct EntityState {
    /// Last known value, kept while updates are missed
    pub value: Option<FieldValue>,
    pub available: bool,
    /// Set after a missed update, cleared by the next good one
    pub stale: Option<Staleness>,
}

impl EntityState {
    pub fn is_stale(&self) -> bool {
        self.stale.is_some()
    }
}

pub struct Entity {
    descriptor: EntityDescriptor,
    availability: AvailabilityState,
    value: Option<FieldValue>,
    /// The last value read back from the device
    confirmed: Option<FieldValue>,
    stale_cause: Option<String>,
    write_in_progress: bool,
}

impl Entity {
    pub fn new(descriptor: EntityDescriptor) -> Self {
        Self {
            descriptor,
            availability: AvailabilityState::default(),
            value: None,
            confirmed: None,
            stale_cause: None,
            write_in_progress: false,
        }
    }

    pub fn descriptor(&self) -> &EntityDescriptor {
        &self.descriptor
    }

    /// Apply one coordinator update. Ignored while a write is in progress so
    /// an in-flight command is not overwritten by the state before it.
    pub fn handle_update(&mut self, update: &CoordinatorUpdate) {
        if self.write_in_progress {
            debug!(entity = %self.descriptor.unique_id, "write in progress, skipping coordinator update");
            return;
        }

        let (outcome, cause) = self.classify(update);
        self.availability = self.availability.update(&outcome);
        match outcome {
            TickOutcome::FieldPresent(value) => {
                self.value = Some(value.clone());
                self.confirmed = Some(value);
                self.stale_cause = None;
            }
            TickOutcome::FieldAbsent | TickOutcome::ReadFailed(_) => {
                self.stale_cause = cause;
            }
        }
    }

    pub fn state(&self) -> EntityState {
        EntityState {
            value: self.value.clone(),
            available: self.availability.is_available(),
            stale: self.stale_cause.as_ref().map(|cause| Staleness {
                missed: self.availability.missed(),
                cause: cause.clone(),
            }),
        }
    }

    /// Count updates lost before they reached this entity as misses.
    ///
    /// At most [`UNAVAILABLE_THRESHOLD`] of them can matter, so larger gaps
    /// are not replayed one by one.
    pub fn handle_missed(&mut self, skipped: u64) {
        if self.write_in_progress {
            return;
        }
        let replay = skipped.min(u64::from(UNAVAILABLE_THRESHOLD));
        for _ in 0..replay {
            self.availability = self.availability.update(&TickOutcome::FieldAbsent);
        }
        if replay > 0 {
            self.stale_cause = Some(format!("Missed {skipped} updates"));
        }
    }

    /// Show `value` right away while it is being written
    pub fn begin_write(&mut self, value: FieldValue) {
        self.write_in_progress = true;
        self.value = Some(value);
    }

    /// A failed write falls back to the last value read from the device
    pub fn end_write(&mut self, applied: bool) {
        self.write_in_progress = false;
        if !applied {
            self.value = self.confirmed.clone();
        }
    }

    fn classify(&self, update: &CoordinatorUpdate) -> (TickOutcome, Option<String>) {
        let fields = match update {
            CoordinatorUpdate::Snapshot(fields) => fields,
            CoordinatorUpdate::Failed(err) => {
                return (TickOutcome::ReadFailed(err.clone()), Some(err.to_string()));
            }
        };

        match fields.get(&self.descriptor.field) {
            None => (TickOutcome::FieldAbsent, Some("No data".to_string())),
            Some(value) if !self.descriptor.kind.accepts(value, &self.descriptor.options) => {
                warn!(entity = %self.descriptor.unique_id, %value, "invalid data type from coordinator");
                (TickOutcome::FieldAbsent, Some("Invalid data type".to_string()))
            }
            Some(value) => (TickOutcome::FieldPresent(value.clone()), None),
        }
    }
}

/// A running entity subscribed to its device's coordinator.
///
/// Dropping the handle stops the subscriber task.
pub struct EntityHandle {
    descriptor: EntityDescriptor,
    entity: Arc<Mutex<Entity>>,
    state: Arc<watch::Sender<EntityState>>,
    dispatcher: Option<Arc<CommandDispatcher>>,
    task: JoinHandle<()>,
}

impl EntityHandle {
    pub fn spawn(
        descriptor: EntityDescriptor,
        coordinator: &PollingCoordinator,
        dispatcher: Option<Arc<CommandDispatcher>>,
    ) -> Self {
        let updates = coordinator.subscribe();
        let mut entity = Entity::new(descriptor.clone());
        // Only a good read is replayed; a failure would be counted twice if
        // it is also still queued on the subscription.
        if let Some(update @ CoordinatorUpdate::Snapshot(_)) = coordinator.latest() {
            entity.handle_update(&update);
        }

        let state = Arc::new(watch::Sender::new(entity.state()));
        let entity = Arc::new(Mutex::new(entity));
        let task = tokio::spawn(Self::follow(updates, entity.clone(), state.clone()));

        Self {
            descriptor,
            entity,
            state,
            dispatcher,
            task,
        }
    }

    pub fn descriptor(&self) -> &EntityDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> EntityState {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<EntityState> {
        self.state.subscribe()
    }

    /// Turn a switch on or off, or pick a select option
    pub async fn set(&self, value: FieldValue) -> Result<(), WriteError> {
        let Some(dispatcher) = self.dispatcher.as_ref().filter(|_| self.descriptor.kind.is_writable()) else {
            return Err(WriteError::Rejected {
                field: self.descriptor.field.clone(),
                reason: RejectReason::NotWritable,
            });
        };

        debug!(entity = %self.descriptor.unique_id, %value, "set");
        self.with_entity(|e| e.begin_write(value.clone()));

        let result = dispatcher
            .execute(&WriteRequest::new(self.descriptor.field.clone(), value))
            .await;

        self.with_entity(|e| e.end_write(result.is_ok()));
        result
    }

    fn with_entity(&self, f: impl FnOnce(&mut Entity)) {
        let mut entity = self.entity.lock();
        f(&mut entity);
        self.state.send_replace(entity.state());
    }

    async fn follow(
        mut updates: broadcast::Receiver<CoordinatorUpdate>,
        entity: Arc<Mutex<Entity>>,
        state: Arc<watch::Sender<EntityState>>,
    ) {
        loop {
            match updates.recv().await {
                Ok(update) => {
                    let mut entity = entity.lock();
                    entity.handle_update(&update);
                    state.send_replace(entity.state());
                }
                Err(RecvError::Lagged(skipped)) => {
                    let mut entity = entity.lock();
                    warn!(entity = %entity.descriptor.unique_id, skipped, "entity fell behind coordinator updates");
                    entity.handle_missed(skipped);
                    state.send_replace(entity.state());
                }
                Err(RecvError::Closed) => return,
            }
        }
    }
}

impl Drop for EntityHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Create one entity per catalog field.
///
/// Encrypted devices are read-only, so they get no switches or selects.
pub fn build_entities(
    identity: &DeviceIdentity,
    catalog: &FieldCatalog,
    coordinator: &PollingCoordinator,
    dispatcher: &Arc<CommandDispatcher>,
) -> Vec<EntityHandle> {
    let device = DeviceInfo::from(identity);
    catalog
        .iter()
        .filter(|spec| !(identity.use_encryption && spec.kind.is_writable()))
        .map(|spec| {
            let descriptor = EntityDescriptor::new(device.clone(), spec);
            let dispatcher = spec.kind.is_writable().then(|| dispatcher.clone());
            EntityHandle::spawn(descriptor, coordinator, dispatcher)
        })
        .collect()
}
