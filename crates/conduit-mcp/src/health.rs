//! Per-server health accounting and the background probe loop.
//!
//! Real tool calls and monitor probes feed the same [`HealthRecord`], so
//! health reflects actual use as well as synthetic checks.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use conduit_core::TransportKind;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

use crate::error::MonitorError;
use crate::registry::ConnectionState;

/// Default number of latency samples kept per server.
pub const DEFAULT_LATENCY_WINDOW: usize = 100;

/// Fixed-capacity ring of recent latencies; the oldest sample is evicted first.
#[derive(Debug, Clone)]
pub struct LatencyWindow {
    samples: VecDeque<Duration>,
    capacity: usize,
}

impl LatencyWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, latency: Duration) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(latency);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn average(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let total: Duration = self.samples.iter().sum();
        Some(total / self.samples.len() as u32)
    }

    /// Nearest-rank percentile over the current samples.
    pub fn percentile(&self, percentile: f64) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<Duration> = self.samples.iter().copied().collect();
        sorted.sort_unstable();

        let rank = ((percentile / 100.0) * sorted.len() as f64).ceil() as usize;
        let index = rank.clamp(1, sorted.len()) - 1;
        Some(sorted[index])
    }
}

/// Rolling statistics for one server.
#[derive(Debug, Clone)]
pub struct HealthRecord {
    pub success_count: u64,
    pub failure_count: u64,
    pub latencies: LatencyWindow,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub connected_since: Option<DateTime<Utc>>,
}

impl HealthRecord {
    pub fn new(latency_window: usize) -> Self {
        Self {
            success_count: 0,
            failure_count: 0,
            latencies: LatencyWindow::new(latency_window),
            last_error: None,
            last_error_at: None,
            last_success_at: None,
            connected_since: None,
        }
    }

    pub fn record_success(&mut self, latency: Duration, at: DateTime<Utc>) {
        self.success_count += 1;
        self.latencies.push(latency);
        self.last_success_at = Some(at);
    }

    pub fn record_failure(&mut self, latency: Duration, error: String, at: DateTime<Utc>) {
        self.failure_count += 1;
        self.latencies.push(latency);
        self.last_error = Some(error);
        self.last_error_at = Some(at);
    }

    /// `success / (success + failure)`, or 0 with no samples.
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            0.0
        } else {
            self.success_count as f64 / total as f64
        }
    }

    /// Build a point-in-time view of this record.
    pub fn snapshot(&self, view: ServerView<'_>, now: DateTime<Utc>) -> HealthSnapshot {
        let connected = view.state == ConnectionState::Connected;
        let uptime = match (connected, self.connected_since) {
            (true, Some(since)) => (now - since).to_std().ok(),
            _ => None,
        };

        HealthSnapshot {
            server: view.server.to_string(),
            state: view.state,
            connected,
            transport: view.transport,
            tool_count: view.tool_count,
            uptime,
            avg_latency: self.latencies.average(),
            p95_latency: self.latencies.percentile(95.0),
            success_count: self.success_count,
            failure_count: self.failure_count,
            success_rate: self.success_rate(),
            last_error: self.last_error.clone(),
            last_error_at: self.last_error_at,
            last_success_at: self.last_success_at,
            connected_since: self.connected_since,
        }
    }
}

/// Registry-side facts a snapshot needs.
#[derive(Debug, Clone, Copy)]
pub struct ServerView<'a> {
    pub server: &'a str,
    pub state: ConnectionState,
    pub transport: Option<TransportKind>,
    pub tool_count: usize,
}

/// Health of one server at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub server: String,
    pub state: ConnectionState,
    pub connected: bool,
    pub transport: Option<TransportKind>,
    pub tool_count: usize,
    /// Time since connecting; only set while connected.
    pub uptime: Option<Duration>,
    pub avg_latency: Option<Duration>,
    pub p95_latency: Option<Duration>,
    pub success_count: u64,
    pub failure_count: u64,
    pub success_rate: f64,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub connected_since: Option<DateTime<Utc>>,
}

/// Health records for all servers behind one lock, so concurrent call
/// completions and probes never lose an update.
#[derive(Debug)]
pub struct HealthTracker {
    records: Mutex<HashMap<String, HealthRecord>>,
    latency_window: usize,
}

impl HealthTracker {
    pub fn new(latency_window: usize) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            latency_window,
        }
    }

    fn update(&self, server: &str, f: impl FnOnce(&mut HealthRecord)) {
        let mut records = self.records.lock();
        let record = records
            .entry(server.to_string())
            .or_insert_with(|| HealthRecord::new(self.latency_window));
        f(record);
    }

    pub fn record_success(&self, server: &str, latency: Duration) {
        let now = Utc::now();
        self.update(server, |r| r.record_success(latency, now));
    }

    pub fn record_failure(&self, server: &str, latency: Duration, error: impl Into<String>) {
        let now = Utc::now();
        let error = error.into();
        self.update(server, |r| r.record_failure(latency, error, now));
    }

    /// Remember an error that is not a call outcome (e.g. the peer went away).
    pub fn note_error(&self, server: &str, error: impl Into<String>) {
        let now = Utc::now();
        let error = error.into();
        self.update(server, |r| {
            r.last_error = Some(error);
            r.last_error_at = Some(now);
        });
    }

    pub fn mark_connected(&self, server: &str, since: DateTime<Utc>) {
        self.update(server, |r| r.connected_since = Some(since));
    }

    /// Forget a server entirely (explicit removal only).
    pub fn clear(&self, server: &str) {
        self.records.lock().remove(server);
    }

    pub fn record(&self, server: &str) -> Option<HealthRecord> {
        self.records.lock().get(server).cloned()
    }

    pub fn snapshot(&self, view: ServerView<'_>) -> HealthSnapshot {
        let now = Utc::now();
        let records = self.records.lock();
        match records.get(view.server) {
            Some(record) => record.snapshot(view, now),
            None => HealthRecord::new(self.latency_window).snapshot(view, now),
        }
    }
}

/// Background sampler that runs a probe on a fixed interval.
#[derive(Debug, Default)]
pub struct HealthMonitor {
    task: Mutex<Option<(JoinHandle<()>, Duration)>>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start probing every `interval`. A running monitor is replaced, never doubled.
    ///
    /// The probe loop runs on the current Tokio runtime; outside one this
    /// fails and nothing changes.
    pub fn start<F, Fut>(&self, interval: Duration, probe: F) -> Result<(), MonitorError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let runtime = Handle::try_current()?;
        let interval = interval.max(Duration::from_millis(1));
        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                probe().await;
            }
        });

        if let Some((previous, _)) = self.task.lock().replace((handle, interval)) {
            previous.abort();
        }
        debug!(interval_ms = interval.as_millis() as u64, "Health monitor started");
        Ok(())
    }

    /// Stop probing. Safe to call when not running.
    pub fn stop(&self) {
        if let Some((handle, _)) = self.task.lock().take() {
            handle.abort();
            debug!("Health monitor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|(handle, _)| !handle.is_finished())
    }

    /// The active probe interval.
    pub fn interval(&self) -> Option<Duration> {
        self.task.lock().as_ref().map(|(_, interval)| *interval)
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
