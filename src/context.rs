use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::ConfigEntry;
use crate::config::DeviceConfig;
use crate::config::OperationalParams;
use crate::config::OptionsUpdate;
use crate::coordinator::PollingCoordinator;
use crate::dispatcher::CommandDispatcher;
use crate::entity::build_entities;
use crate::entity::EntityHandle;
use crate::error::ConfigError;
use crate::error::SetupError;
use crate::field::FieldCatalog;
use crate::lock::AccessLock;
use crate::session::DeviceCatalog;
use crate::session::DeviceSession;
use crate::session::Presence;
use crate::util::mask_address;

const INITIAL_REFRESH_ATTEMPTS: u32 = 5;
const INITIAL_REFRESH_DELAY: Duration = Duration::from_secs(5);

/// The external pieces one device needs
pub struct Collaborators {
    pub session: Box<dyn DeviceSession>,
    pub presence: Arc<dyn Presence>,
    pub catalog: Arc<dyn DeviceCatalog>,
}

/// Everything that runs for one configured device.
///
/// Owns the access lock, coordinator and dispatcher and hands them to the
/// entities it builds.
pub struct IntegrationContext {
    entry: ConfigEntry,
    config: DeviceConfig,
    lock: Arc<AccessLock>,
    coordinator: Arc<PollingCoordinator>,
    dispatcher: Arc<CommandDispatcher>,
    catalog: Arc<FieldCatalog>,
    poller: JoinHandle<()>,
}

impl IntegrationContext {
    /// Bring a configured device up and start polling it.
    ///
    /// Fails with [`SetupError::NotReady`] if the device is not advertising.
    /// If the initial reads all fail the device is still set up and the
    /// regular schedule keeps trying.
    pub async fn setup(entry: ConfigEntry, collaborators: Collaborators) -> Result<Self, SetupError> {
        let config = entry.runtime()?;
        let address = &config.identity.address;
        debug!(address = %mask_address(address), "setting up device");

        if !collaborators.presence.is_reachable(address).await {
            return Err(SetupError::NotReady(mask_address(address)));
        }

        let lock = Arc::new(AccessLock::new(address, collaborators.session));
        let coordinator = Arc::new(PollingCoordinator::new(&config, collaborators.presence, lock.clone()));
        let catalog = Arc::new(FieldCatalog::enumerate(collaborators.catalog.as_ref()));
        let dispatcher = Arc::new(CommandDispatcher::new(
            &config.identity,
            catalog.clone(),
            lock.clone(),
            coordinator.watch_params(),
            coordinator.refresh_trigger(),
        ));

        coordinator
            .first_refresh(INITIAL_REFRESH_ATTEMPTS, INITIAL_REFRESH_DELAY)
            .await;
        let poller = tokio::spawn(coordinator.clone().run());

        info!(address = %mask_address(address), dev_type = %config.identity.dev_type, "device set up");
        Ok(Self {
            entry,
            config,
            lock,
            coordinator,
            dispatcher,
            catalog,
            poller,
        })
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// The entry as it should currently be persisted
    pub fn entry(&self) -> &ConfigEntry {
        &self.entry
    }

    pub fn coordinator(&self) -> &Arc<PollingCoordinator> {
        &self.coordinator
    }

    pub fn dispatcher(&self) -> &Arc<CommandDispatcher> {
        &self.dispatcher
    }

    /// Create the entities for every field the device exposes
    pub fn entities(&self) -> Vec<EntityHandle> {
        build_entities(&self.config.identity, &self.catalog, &self.coordinator, &self.dispatcher)
    }

    /// Apply new user settings to the running device
    pub fn update_options(&mut self, update: &OptionsUpdate) -> Result<OperationalParams, ConfigError> {
        let params = self.config.params.apply(update)?;
        self.config.params = params;
        self.entry = self.entry.with_options(params);
        self.coordinator.update_params(params);
        info!(address = %mask_address(&self.config.identity.address), ?params, "options updated");
        Ok(params)
    }

    /// Stop polling and disconnect once any operation in flight is done
    pub async fn unload(self) {
        self.poller.abort();
        let mut session = self.lock.acquire("unload").await;
        if session.is_connected() {
            if let Err(err) = session.disconnect().await {
                warn!(address = %mask_address(&self.config.identity.address), "disconnect failed: {err:#}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceIdentity;
    use crate::field::FieldKind;
    use crate::field::FieldValue;
    use crate::mock::MockCatalog;
    use crate::mock::MockDevice;
    use crate::mock::MockPresence;
    use crate::mock::Op;
    use tokio::time::Instant;

    fn entry(use_encryption: bool) -> ConfigEntry {
        ConfigEntry::new(DeviceIdentity {
            address: "AC:BF:71:12:34:56".into(),
            name: "AC200M2237".into(),
            dev_type: "AC200M".into(),
            use_encryption,
        })
    }

    fn collaborators(device: &Arc<MockDevice>, presence: Arc<MockPresence>) -> Collaborators {
        Collaborators {
            session: device.session(),
            presence,
            catalog: Arc::new(MockCatalog),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_requires_presence() {
        let device = MockDevice::new();
        let result = IntegrationContext::setup(entry(false), collaborators(&device, MockPresence::new(false))).await;
        assert!(matches!(result, Err(SetupError::NotReady(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_survives_failed_initial_reads() {
        let device = MockDevice::new();
        device.fail_reads(true);

        let started = Instant::now();
        let context = IntegrationContext::setup(entry(false), collaborators(&device, MockPresence::new(true)))
            .await
            .unwrap();

        assert_eq!(device.count(Op::Read), 5);
        assert!(started.elapsed() >= Duration::from_secs(20));
        context.unload().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_entities_follow_coordinator() {
        let device = MockDevice::new();
        let presence = MockPresence::new(true);
        let context = IntegrationContext::setup(entry(false), collaborators(&device, presence.clone()))
            .await
            .unwrap();

        let entities = context.entities();
        assert_eq!(entities.len(), 4);
        let switch = entities.iter().find(|e| e.descriptor().kind == FieldKind::Switch).unwrap();
        assert_eq!(switch.descriptor().unique_id, "switch.ac200m2237_ac_output");
        assert!(entities.iter().all(|e| e.descriptor().device.model == "AC200M"));
        assert_eq!(switch.state().value, Some(FieldValue::Bool(false)));

        // power_generation is never reported
        let binary = entities.iter().find(|e| e.descriptor().kind == FieldKind::BinarySensor).unwrap();
        assert!(binary.state().value.is_none());

        // Four unreachable ticks keep the switch available, the fifth does not.
        presence.set(false);
        let mut state = switch.watch();
        for tick in 1..=5 {
            tokio::time::sleep(Duration::from_secs(20)).await;
            state.changed().await.unwrap();
            assert_eq!(state.borrow().available, tick < 5, "after tick {tick}");
        }

        presence.set(true);
        tokio::time::sleep(Duration::from_secs(20)).await;
        state.changed().await.unwrap();
        assert!(state.borrow().available);

        context.unload().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_write_refreshes_state() {
        let device = MockDevice::new();
        let context = IntegrationContext::setup(entry(false), collaborators(&device, MockPresence::new(true)))
            .await
            .unwrap();
        let entities = context.entities();
        let switch = entities.iter().find(|e| e.descriptor().field == "ac_output").unwrap();

        switch.set(FieldValue::Bool(true)).await.unwrap();
        assert_eq!(switch.state().value, Some(FieldValue::Bool(true)));

        // The refresh requested by the write confirms the new value.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(device.count(Op::Read), 2);
        let latest = context.coordinator().latest().unwrap();
        assert_eq!(latest.fields().unwrap().get("ac_output"), Some(&FieldValue::Bool(true)));

        context.unload().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_switch_write_rolls_back() {
        let device = MockDevice::new();
        device.fail_writes(true);
        let context = IntegrationContext::setup(entry(false), collaborators(&device, MockPresence::new(true)))
            .await
            .unwrap();
        let entities = context.entities();
        let switch = entities.iter().find(|e| e.descriptor().field == "ac_output").unwrap();

        assert!(switch.set(FieldValue::Bool(true)).await.is_err());
        assert_eq!(switch.state().value, Some(FieldValue::Bool(false)));

        context.unload().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_encrypted_device_gets_read_only_entities() {
        let device = MockDevice::new();
        let context = IntegrationContext::setup(entry(true), collaborators(&device, MockPresence::new(true)))
            .await
            .unwrap();

        let entities = context.entities();
        assert_eq!(entities.len(), 2);
        assert!(entities.iter().all(|e| !e.descriptor().kind.is_writable()));

        context.unload().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_options_reschedules() {
        let device = MockDevice::new();
        let mut context = IntegrationContext::setup(entry(false), collaborators(&device, MockPresence::new(true)))
            .await
            .unwrap();

        let params = context
            .update_options(&OptionsUpdate {
                polling_interval: Some(60),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(params.polling_interval, 60);
        assert_eq!(context.entry().options, Some(params));

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(device.count(Op::Read), 1);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(device.count(Op::Read), 2);

        assert!(context.update_options(&OptionsUpdate {
            polling_timeout: Some(0),
            ..Default::default()
        })
        .is_err());
        context.unload().await;
    }
}
