use std::ops::Deref;
use std::ops::DerefMut;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use tokio::sync::Mutex;
use tokio::sync::MutexGuard;
use tokio::time::Instant;
use tracing::trace;

use crate::session::DeviceSession;
use crate::util::mask_address;

/// The sole way to reach a device's BLE link.
///
/// The lock owns the [`DeviceSession`], so holding an [`AccessGuard`] is the
/// only way to read from or write to the device. At most one read or write
/// is in flight per device. Waiters are served in FIFO order.
pub struct AccessLock {
    session: Mutex<Box<dyn DeviceSession>>,
    address: String,
    acquisitions: AtomicU64,
}

impl AccessLock {
    pub fn new(address: &str, session: Box<dyn DeviceSession>) -> Self {
        Self {
            session: Mutex::new(session),
            address: mask_address(address),
            acquisitions: AtomicU64::new(0),
        }
    }

    /// Wait until no other operation holds the link, then take it.
    ///
    /// The link is released when the guard is dropped, whatever way the
    /// guarded operation exits.
    pub async fn acquire(&self, purpose: &'static str) -> AccessGuard<'_> {
        let session = self.session.lock().await;
        self.granted(session, purpose)
    }

    /// Take the link only if it is free right now
    pub fn try_acquire(&self, purpose: &'static str) -> Option<AccessGuard<'_>> {
        let session = self.session.try_lock().ok()?;
        Some(self.granted(session, purpose))
    }

    /// How many times the link has been handed out
    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::Relaxed)
    }

    fn granted<'a>(&'a self, session: MutexGuard<'a, Box<dyn DeviceSession>>, purpose: &'static str) -> AccessGuard<'a> {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        trace!(address = %self.address, purpose, "device link acquired");
        AccessGuard {
            session,
            address: &self.address,
            purpose,
            acquired_at: Instant::now(),
        }
    }
}

/// Exclusive access to the device session
pub struct AccessGuard<'a> {
    session: MutexGuard<'a, Box<dyn DeviceSession>>,
    address: &'a str,
    purpose: &'static str,
    acquired_at: Instant,
}

impl AccessGuard<'_> {
    pub fn release(self) {}
}

impl Deref for AccessGuard<'_> {
    type Target = dyn DeviceSession;

    fn deref(&self) -> &Self::Target {
        &**self.session
    }
}

impl DerefMut for AccessGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut **self.session
    }
}

impl Drop for AccessGuard<'_> {
    fn drop(&mut self) {
        trace!(
            address = %self.address,
            purpose = self.purpose,
            held_ms = self.acquired_at.elapsed().as_millis() as u64,
            "device link released"
        );
    }
}
