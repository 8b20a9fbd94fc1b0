//! In-memory device used by the unit tests.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::field::FieldMap;
use crate::field::FieldValue;
use crate::field::SelectField;
use crate::session::DeviceCatalog;
use crate::session::DeviceSession;
use crate::session::Presence;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Op {
    Read,
    Write,
}

/// One completed session call
#[derive(Debug, Clone, Copy)]
pub(crate) struct Span {
    pub op: Op,
    pub start: Instant,
    pub end: Instant,
}

pub(crate) struct MockDevice {
    fields: Mutex<FieldMap>,
    timeline: Mutex<Vec<Span>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    connected: AtomicBool,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    read_delay: Mutex<Duration>,
    write_delay: Mutex<Duration>,
}

impl MockDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            fields: Mutex::new(
                FieldMap::new()
                    .with("total_battery_percent", FieldValue::Numeric(87.0))
                    .with("ac_output", FieldValue::Bool(false))
                    .with("charging_mode", FieldValue::Enum("STANDARD".into())),
            ),
            timeline: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            connected: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            read_delay: Mutex::new(Duration::from_millis(500)),
            write_delay: Mutex::new(Duration::from_millis(200)),
        })
    }

    pub fn session(self: &Arc<Self>) -> Box<dyn DeviceSession> {
        Box::new(MockSession(self.clone()))
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_read_delay(&self, delay: Duration) {
        *self.read_delay.lock() = delay;
    }

    pub fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.lock() = delay;
    }

    pub fn timeline(&self) -> Vec<Span> {
        self.timeline.lock().clone()
    }

    pub fn count(&self, op: Op) -> usize {
        self.timeline.lock().iter().filter(|s| s.op == op).count()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn run(&self, op: Op, delay: Duration) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let start = Instant::now();
        tokio::time::sleep(delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.timeline.lock().push(Span {
            op,
            start,
            end: Instant::now(),
        });
    }
}

struct MockSession(Arc<MockDevice>);

#[async_trait]
impl DeviceSession for MockSession {
    async fn connect(&mut self) -> anyhow::Result<()> {
        self.0.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&mut self) -> anyhow::Result<()> {
        self.0.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.0.connected.load(Ordering::SeqCst)
    }

    async fn read(&mut self, _timeout: Duration, _max_retries: u32) -> anyhow::Result<FieldMap> {
        let delay = *self.0.read_delay.lock();
        self.0.run(Op::Read, delay).await;
        if self.0.fail_reads.load(Ordering::SeqCst) {
            return Err(anyhow!("no response"));
        }
        Ok(self.0.fields.lock().clone())
    }

    async fn write(&mut self, field: &str, value: &FieldValue, _timeout: Duration) -> anyhow::Result<()> {
        let delay = *self.0.write_delay.lock();
        self.0.run(Op::Write, delay).await;
        if self.0.fail_writes.load(Ordering::SeqCst) {
            return Err(anyhow!("write not acknowledged"));
        }
        let updated = self.0.fields.lock().clone().with(field, value.clone());
        *self.0.fields.lock() = updated;
        Ok(())
    }
}

pub(crate) struct MockPresence(AtomicBool);

impl MockPresence {
    pub fn new(present: bool) -> Arc<Self> {
        Arc::new(Self(AtomicBool::new(present)))
    }

    pub fn set(&self, present: bool) {
        self.0.store(present, Ordering::SeqCst);
    }
}

#[async_trait]
impl Presence for MockPresence {
    async fn is_reachable(&self, _address: &str) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub(crate) struct MockCatalog;

impl DeviceCatalog for MockCatalog {
    fn sensor_fields(&self) -> Vec<String> {
        vec!["total_battery_percent".into()]
    }

    fn bool_fields(&self) -> Vec<String> {
        vec!["power_generation".into()]
    }

    fn switch_fields(&self) -> Vec<String> {
        vec!["ac_output".into()]
    }

    fn select_fields(&self) -> Vec<SelectField> {
        vec![SelectField {
            name: "charging_mode".into(),
            options: vec!["STANDARD".into(), "SILENT".into(), "TURBO".into()],
        }]
    }
}
