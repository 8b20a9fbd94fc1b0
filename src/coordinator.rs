//! Periodic polling of one device.
//!
//! Each tick checks that the device is advertising, takes the
//! [`AccessLock`], reads every field and publishes the outcome to all
//! subscribers. Read failures never leave the coordinator: they are
//! published as [`CoordinatorUpdate::Failed`] and end up as missed updates
//! in the entities' availability bookkeeping.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::sync::Notify;
use tokio::time::timeout;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::DeviceConfig;
use crate::config::OperationalParams;
use crate::config::MAX_POLLING_INTERVAL_S;
use crate::error::ReadFailure;
use crate::field::FieldMap;
use crate::lock::AccessLock;
use crate::session::Presence;
use crate::util::mask_address;

const UPDATE_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    CheckingReachability,
    Reading,
    Publishing,
    Failed,
}

/// Published once per tick or refresh
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorUpdate {
    Snapshot(Arc<FieldMap>),
    Failed(ReadFailure),
}

impl CoordinatorUpdate {
    pub fn fields(&self) -> Option<&FieldMap> {
        match self {
            CoordinatorUpdate::Snapshot(fields) => Some(fields),
            CoordinatorUpdate::Failed(_) => None,
        }
    }
}

/// Asks the coordinator for one read outside its schedule.
///
/// Requests made while a read is pending are coalesced into one.
#[derive(Clone, Default)]
pub struct RefreshTrigger {
    notify: Arc<Notify>,
    requested: Arc<AtomicU64>,
}

impl RefreshTrigger {
    pub fn request(&self) {
        self.requested.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
    }

    /// Total number of requests made so far
    pub fn requested(&self) -> u64 {
        self.requested.load(Ordering::Relaxed)
    }

    async fn notified(&self) {
        self.notify.notified().await
    }
}

pub struct PollingCoordinator {
    address: String,
    presence: Arc<dyn Presence>,
    lock: Arc<AccessLock>,
    params: watch::Sender<OperationalParams>,
    /// Held for a whole read cycle so cycles never overlap
    cycle: Mutex<()>,
    refresh_trigger: RefreshTrigger,
    updates: broadcast::Sender<CoordinatorUpdate>,
    latest: watch::Sender<Option<CoordinatorUpdate>>,
    state: watch::Sender<CoordinatorState>,
}

impl PollingCoordinator {
    pub fn new(config: &DeviceConfig, presence: Arc<dyn Presence>, lock: Arc<AccessLock>) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            address: config.identity.address.clone(),
            presence,
            lock,
            params: watch::Sender::new(config.params),
            cycle: Mutex::new(()),
            refresh_trigger: RefreshTrigger::default(),
            updates,
            latest: watch::Sender::new(None),
            state: watch::Sender::new(CoordinatorState::Idle),
        }
    }

    /// Receive every update published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorUpdate> {
        self.updates.subscribe()
    }

    /// The most recent update, if any tick has completed yet
    pub fn latest(&self) -> Option<CoordinatorUpdate> {
        self.latest.borrow().clone()
    }

    pub fn watch_latest(&self) -> watch::Receiver<Option<CoordinatorUpdate>> {
        self.latest.subscribe()
    }

    pub fn state(&self) -> CoordinatorState {
        *self.state.borrow()
    }

    pub fn refresh_trigger(&self) -> RefreshTrigger {
        self.refresh_trigger.clone()
    }

    pub fn params(&self) -> OperationalParams {
        *self.params.borrow()
    }

    pub fn watch_params(&self) -> watch::Receiver<OperationalParams> {
        self.params.subscribe()
    }

    /// Replace the operational parameters. A running poller picks up the new
    /// interval right away; the new timeout applies from the next read.
    pub fn update_params(&self, params: OperationalParams) {
        self.params.send_replace(params);
    }

    /// Run one read cycle now and publish its outcome.
    ///
    /// Waits for any cycle already in progress to finish first.
    pub async fn refresh(&self) -> CoordinatorUpdate {
        let _cycle = self.cycle.lock().await;
        let update = self.read_cycle().await;
        self.publish(update.clone());
        update
    }

    /// Refresh until a read succeeds or `attempts` are used up.
    ///
    /// Returns whether a field map was published.
    pub async fn first_refresh(&self, attempts: u32, delay: Duration) -> bool {
        let address = mask_address(&self.address);
        for attempt in 1..=attempts {
            info!(address = %address, attempt, attempts, "initial data fetch");
            match self.refresh().await {
                CoordinatorUpdate::Snapshot(_) => {
                    info!(address = %address, "initial data fetch successful");
                    return true;
                }
                CoordinatorUpdate::Failed(err) if attempt < attempts => {
                    warn!(address = %address, attempt, %err, "initial data fetch failed, retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                }
                CoordinatorUpdate::Failed(err) => {
                    warn!(
                        address = %address,
                        %err,
                        "initial data fetch failed after {attempts} attempts, leaving it to the polling schedule"
                    );
                }
            }
        }
        false
    }

    /// Poll on the configured interval until the task is aborted.
    ///
    /// Out-of-band refresh requests are served between ticks. A change of
    /// parameters restarts the schedule with the new interval.
    pub async fn run(self: Arc<Self>) {
        let mut params = self.params.subscribe();
        loop {
            // Parameters set without validation still get a schedule that cannot overflow.
            let period = params
                .borrow_and_update()
                .interval()
                .clamp(Duration::from_secs(1), Duration::from_secs(MAX_POLLING_INTERVAL_S));
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!(address = %mask_address(&self.address), ?period, "polling schedule started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.refresh().await;
                    }
                    _ = self.refresh_trigger.notified() => {
                        debug!(address = %mask_address(&self.address), "out-of-band refresh");
                        self.refresh().await;
                    }
                    changed = params.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        break;
                    }
                }
            }
        }
    }

    async fn read_cycle(&self) -> CoordinatorUpdate {
        let params = self.params();
        let address = mask_address(&self.address);

        self.state.send_replace(CoordinatorState::CheckingReachability);
        if !self.presence.is_reachable(&self.address).await {
            // Not worth queueing on the lock for a device that is not there.
            debug!(address = %address, "device not present, skipping read");
            self.state.send_replace(CoordinatorState::Failed);
            return CoordinatorUpdate::Failed(ReadFailure::Unreachable);
        }

        self.state.send_replace(CoordinatorState::Reading);
        let mut session = self.lock.acquire("read").await;
        let result = timeout(params.timeout(), async {
            if !session.is_connected() {
                session.connect().await?;
            }
            session.read(params.timeout(), params.max_retries).await
        })
        .await;
        session.release();

        match result {
            Ok(Ok(fields)) => {
                debug!(address = %address, fields = fields.len(), "read complete");
                CoordinatorUpdate::Snapshot(Arc::new(fields))
            }
            Ok(Err(err)) => {
                warn!(address = %address, "read failed: {err:#}");
                self.state.send_replace(CoordinatorState::Failed);
                CoordinatorUpdate::Failed(ReadFailure::Transport(format!("{err:#}")))
            }
            Err(_) => {
                warn!(address = %address, timeout = ?params.timeout(), "read timed out");
                self.state.send_replace(CoordinatorState::Failed);
                CoordinatorUpdate::Failed(ReadFailure::Timeout(params.timeout()))
            }
        }
    }

    fn publish(&self, update: CoordinatorUpdate) {
        if matches!(update, CoordinatorUpdate::Snapshot(_)) {
            self.state.send_replace(CoordinatorState::Publishing);
        }
        self.latest.send_replace(Some(update.clone()));
        // No subscribers is fine.
        let _ = self.updates.send(update);
        self.state.send_replace(CoordinatorState::Idle);
    }
}
