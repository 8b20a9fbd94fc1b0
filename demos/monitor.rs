//! Report whether a device is advertising, the way the coordinator sees it.
//!
//! ```text
//! RUST_LOG=bluetti_bt=trace cargo run --example monitor -- AC:BF:71:12:34:56
//! ```

use std::time::Duration;

use bluetti_bt::mask_address;
use bluetti_bt::AdvertisementMonitor;
use bluetti_bt::Presence;
use tracing_subscriber::EnvFilter;

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let address = std::env::args()
        .nth(1)
        .ok_or_else(|| anyhow::anyhow!("usage: monitor <address or name>"))?;

    let monitor = AdvertisementMonitor::start(Duration::from_secs(30)).await?;
    loop {
        tokio::time::sleep(Duration::from_secs(5)).await;
        let reachable = monitor.is_reachable(&address).await;
        tracing::info!(address = %mask_address(&address), reachable);
    }
}
