use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use bluest::Adapter;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::session::Presence;

/// Tracks which devices are advertising, from a background BLE scan.
///
/// A device counts as reachable if it advertised within the freshness
/// window. Devices are matched by advertised name or by platform device id,
/// which contains the MAC address on Linux and Windows.
pub struct AdvertisementMonitor {
    seen: Arc<Mutex<SeenDevices>>,
    scan: JoinHandle<()>,
}

impl AdvertisementMonitor {
    pub const DEFAULT_WINDOW: Duration = Duration::from_secs(300);
    // Pause before restarting a scan that ended or failed
    const RESCAN_DELAY_S: u64 = 5;

    /// Start scanning on the default adapter
    pub async fn start(window: Duration) -> anyhow::Result<Self> {
        let adapter = Adapter::default()
            .await
            .ok_or(anyhow!("Default adapter not found"))?;
        adapter.wait_available().await?;

        let seen = Arc::new(Mutex::new(SeenDevices::new(window)));
        let scan = tokio::spawn(Self::scan(adapter, seen.clone()));

        Ok(Self { seen, scan })
    }

    pub fn stop(self) {
        self.scan.abort();
    }

    async fn scan(adapter: Adapter, seen: Arc<Mutex<SeenDevices>>) {
        loop {
            if let Err(err) = Self::record_advertisements(&adapter, &seen).await {
                warn!(%err, "BLE scan failed, restarting");
            }
            tokio::time::sleep(Duration::from_secs(Self::RESCAN_DELAY_S)).await;
        }
    }

    async fn record_advertisements(adapter: &Adapter, seen: &Mutex<SeenDevices>) -> anyhow::Result<()> {
        let mut events = adapter.scan(&[]).await?;
        debug!("BLE scan started");
        while let Some(advertisement) = events.next().await {
            let id = format!("{:?}", advertisement.device.id());
            let name = advertisement.adv_data.local_name;
            trace!(%id, ?name, rssi = ?advertisement.rssi, "advertisement");
            seen.lock().record(&id, name.as_deref(), Instant::now());
        }
        Err(anyhow!("end of advertisement stream"))
    }
}

impl Drop for AdvertisementMonitor {
    fn drop(&mut self) {
        self.scan.abort();
    }
}

#[async_trait]
impl Presence for AdvertisementMonitor {
    async fn is_reachable(&self, address: &str) -> bool {
        self.seen.lock().seen(address, Instant::now())
    }
}

/// Last advertisement time per identifier, stored in uppercase.
///
/// Only identifiers heard within the window are kept. Advertisers with
/// rotating random addresses would otherwise pile up forever.
#[derive(Debug)]
struct SeenDevices {
    window: Duration,
    last_seen: HashMap<String, Instant>,
}

impl SeenDevices {
    fn new(window: Duration) -> Self {
        Self {
            window,
            last_seen: HashMap::new(),
        }
    }

    fn record(&mut self, id: &str, name: Option<&str>, at: Instant) {
        let window = self.window;
        self.last_seen.retain(|_, seen| at.saturating_duration_since(*seen) <= window);
        self.last_seen.insert(id.to_uppercase(), at);
        if let Some(name) = name {
            self.last_seen.insert(name.to_uppercase(), at);
        }
    }

    fn seen(&self, address: &str, now: Instant) -> bool {
        let needle = address.to_uppercase();
        self.last_seen
            .iter()
            .any(|(key, &at)| key.contains(&needle) && now.saturating_duration_since(at) <= self.window)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.last_seen.len()
    }
}
