use crate::alerts::AlertLevel;
use crate::collector::StatsCollector;
use crate::metrics::Metrics;
use crate::snapshot::Snapshot;
use crate::store::{Sample, StorageSample, Store, StoreError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("store write failed: {0}")]
    Store(#[from] StoreError),
    #[error("store task failed: {0}")]
    Task(#[from] JoinError),
}

impl RecorderError {
    fn stage(&self) -> &'static str {
        match self {
            RecorderError::Store(_) => "store",
            RecorderError::Task(_) => "task",
        }
    }
}

/// Flattens a snapshot into one persisted row. Download-manager figures come from the session
/// summary and are zero while the integration is disabled or unreachable.
pub fn build_sample(snapshot: &Snapshot) -> Sample {
    let m = &snapshot.memory;
    let session = snapshot
        .transmission
        .session
        .as_ref()
        .filter(|_| snapshot.transmission.enabled && snapshot.transmission.error.is_none());

    Sample {
        ts_ms: snapshot.timestamp_ms,
        cpu_load1: snapshot.cpu.load1,
        cpu_load5: snapshot.cpu.load5,
        cpu_load15: snapshot.cpu.load15,
        mem_used_mb: clamp_i64(m.used_mb),
        mem_total_mb: clamp_i64(m.total_mb),
        mem_swap_used_mb: clamp_i64(m.swap_used_mb),
        mem_swap_total_mb: clamp_i64(m.swap_total_mb),
        mem_free_mb: clamp_i64(m.free_mb),
        mem_available_mb: clamp_i64(m.available_mb),
        mem_shared_mb: clamp_i64(m.shared_mb),
        mem_buffers_mb: clamp_i64(m.buffers_mb),
        mem_cached_mb: clamp_i64(m.cached_mb),
        mem_buffcache_mb: clamp_i64(m.buff_cache_mb),
        mem_used_pct: m.used_percent,
        disk_used_percent: snapshot.disk.used_percent,
        disk_size_bytes: clamp_i64(snapshot.disk.size_bytes),
        net_rx_bps: snapshot.network.total_rx_bps,
        net_tx_bps: snapshot.network.total_tx_bps,
        tx_download_bps: session.map(|s| s.download_bps).unwrap_or(0.0),
        tx_upload_bps: session.map(|s| s.upload_bps).unwrap_or(0.0),
        tx_active_torrents: session.map(|s| clamp_i64(s.active_count)).unwrap_or(0),
    }
}

pub fn build_storage_samples(snapshot: &Snapshot, ts_ms: i64) -> Vec<StorageSample> {
    snapshot
        .storage
        .iter()
        .map(|d| StorageSample {
            ts_ms,
            device_fs: d.fs.clone(),
            mount: d.mount.clone(),
            device_type: d.class.as_str().to_string(),
            total_bytes: clamp_i64(d.total_bytes),
            used_bytes: clamp_i64(d.used_bytes),
            use_percent: d.use_percent,
        })
        .collect()
}

fn clamp_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

/// Everything one tick needs; cloned into the background task.
#[derive(Clone)]
struct Tick {
    collector: Arc<StatsCollector>,
    store: Store,
    metrics: Option<Arc<Metrics>>,
}

impl Tick {
    async fn run(&self) -> Result<(), RecorderError> {
        let snapshot = self.collector.collect().await;
        let sample = build_sample(&snapshot);
        let storage = build_storage_samples(&snapshot, sample.ts_ms);

        let store = self.store.clone();
        let row = sample.clone();
        tokio::task::spawn_blocking(move || store.append_tick(&row, &storage)).await??;

        if let Some(metrics) = &self.metrics {
            metrics.update_from_sample(&sample);
            metrics.update_storage(&snapshot.storage);
        }

        for device in snapshot.storage.iter().filter(|d| d.alert == AlertLevel::Crit) {
            warn!(
                device_type = device.class.as_str(),
                device = %device.fs,
                mount = %device.mount,
                use_percent = device.use_percent,
                "critical storage usage"
            );
            if let Some(metrics) = &self.metrics {
                metrics.inc_storage_alert(device.class.as_str());
            }
        }
        Ok(())
    }
}

struct Running {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Fixed-cadence writer of samples. The first tick fires as soon as it starts.
pub struct MetricsRecorder {
    tick: Tick,
    interval: Duration,
    running: Mutex<Option<Running>>,
}

impl MetricsRecorder {
    pub fn new(collector: Arc<StatsCollector>, store: Store, interval: Duration) -> Self {
        Self {
            tick: Tick {
                collector,
                store,
                metrics: None,
            },
            interval,
            running: Mutex::new(None),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.tick.metrics = Some(metrics);
        self
    }

    fn state(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.state().is_some()
    }

    /// Returns `false` if the recorder was already running.
    pub fn start(&self) -> bool {
        let mut state = self.state();
        if state.is_some() {
            return false;
        }
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(record_loop(self.tick.clone(), self.interval, shutdown_rx));
        *state = Some(Running { shutdown, handle });
        info!(
            interval = %humantime::format_duration(self.interval),
            "metrics recorder started"
        );
        true
    }

    /// Stops scheduling ticks and waits for an in-flight tick to finish. No-op when stopped.
    pub async fn stop(&self) {
        let running = self.state().take();
        let Some(running) = running else {
            return;
        };
        let _ = running.shutdown.send(true);
        if let Err(err) = running.handle.await {
            error!(error = %err, "metrics recorder task ended abnormally");
        }
        info!("metrics recorder stopped");
    }
}

async fn record_loop(tick: Tick, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if let Err(err) = tick.run().await {
                    error!(stage = err.stage(), error = %err, "recorder tick failed");
                    if let Some(metrics) = &tick.metrics {
                        metrics.inc_record_error(err.stage());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertThreshold;
    use crate::collector::CollectorOptions;
    use crate::collectors::testing::static_sources;
    use crate::snapshot::{
        DeviceClass, MemoryStat, NetworkReport, StorageDevice, TransmissionReport,
    };
    use crate::store::SampleQuery;
    use crate::transmission::SessionSummary;
    use rusqlite::Connection;
    use tempfile::tempdir;

    fn collector() -> Arc<StatsCollector> {
        Arc::new(StatsCollector::new(
            static_sources(),
            None,
            CollectorOptions {
                command_timeout: Duration::from_millis(200),
                public_ip_timeout: Duration::from_millis(200),
                rpc_timeout: Duration::from_millis(200),
                memory_alerts: AlertThreshold::default(),
                storage_alerts: AlertThreshold::default(),
            },
        ))
    }

    fn session() -> SessionSummary {
        SessionSummary {
            download_bps: 8_000_000.0,
            upload_bps: 800_000.0,
            download: "8.00 Mbps".to_string(),
            upload: "800.00 Kbps".to_string(),
            active_count: 3,
            paused_count: 1,
            total_count: 4,
        }
    }

    fn snapshot() -> Snapshot {
        Snapshot {
            timestamp_ms: 1_700_000_000_000,
            memory: MemoryStat {
                total_mb: 3793,
                used_mb: 925,
                buff_cache_mb: 2280,
                used_percent: 24.4,
                ..MemoryStat::default()
            },
            network: NetworkReport {
                total_rx_bps: 100_000.0,
                total_tx_bps: 5_000.0,
                ..NetworkReport::default()
            },
            storage: vec![StorageDevice {
                fs: "/dev/sda1".to_string(),
                mount: "/mnt/media".to_string(),
                class: DeviceClass::Hdd,
                total_bytes: 1_000,
                used_bytes: 950,
                use_percent: 95.0,
                alert: AlertLevel::Crit,
            }],
            transmission: TransmissionReport {
                enabled: true,
                error: None,
                session: Some(session()),
                active: Vec::new(),
            },
            ..Snapshot::default()
        }
    }

    #[test]
    fn sample_projects_snapshot() {
        let sample = build_sample(&snapshot());
        assert_eq!(sample.ts_ms, 1_700_000_000_000);
        assert_eq!(sample.mem_used_mb, 925);
        assert_eq!(sample.mem_buffcache_mb, 2280);
        assert_eq!(sample.mem_used_pct, 24.4);
        assert_eq!(sample.net_rx_bps, 100_000.0);
        assert_eq!(sample.tx_download_bps, 8_000_000.0);
        assert_eq!(sample.tx_upload_bps, 800_000.0);
        assert_eq!(sample.tx_active_torrents, 3);
        assert_eq!(sample.disk_used_percent, 0.0);
    }

    #[test]
    fn unreachable_download_manager_records_zero() {
        let mut snap = snapshot();
        snap.transmission.error = Some("down".to_string());
        let sample = build_sample(&snap);
        assert_eq!(sample.tx_download_bps, 0.0);
        assert_eq!(sample.tx_active_torrents, 0);

        snap.transmission = TransmissionReport::disabled();
        assert_eq!(build_sample(&snap).tx_upload_bps, 0.0);
    }

    #[test]
    fn storage_rows_share_tick_timestamp() {
        let rows = build_storage_samples(&snapshot(), 42);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].ts_ms, 42);
        assert_eq!(rows[0].device_type, "HDD");
        assert_eq!(rows[0].used_bytes, 950);
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let recorder = MetricsRecorder::new(collector(), store.clone(), Duration::from_secs(3600));

        recorder.stop().await;
        assert!(recorder.start());
        assert!(!recorder.start());
        assert!(recorder.is_running());

        tokio::time::sleep(Duration::from_millis(200)).await;
        recorder.stop().await;
        recorder.stop().await;
        assert!(!recorder.is_running());

        let rows = store.query_samples(SampleQuery::Latest { limit: 10 }).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].mem_total_mb, 3793);

        assert!(recorder.start());
        recorder.stop().await;
    }

    #[tokio::test]
    async fn ticks_write_samples_storage_and_metrics() {
        let store = Store::open_in_memory().unwrap();
        let metrics = Metrics::new().unwrap();
        let recorder = MetricsRecorder::new(collector(), store.clone(), Duration::from_millis(50))
            .with_metrics(metrics.clone());

        recorder.start();
        tokio::time::sleep(Duration::from_millis(280)).await;
        recorder.stop().await;

        let samples = store.query_samples(SampleQuery::Latest { limit: 100 }).unwrap();
        assert!(samples.len() >= 2, "expected several ticks, got {}", samples.len());
        let storage = store
            .query_storage_samples(&crate::store::StorageQuery::default())
            .unwrap();
        assert_eq!(storage.len(), samples.len());
        assert_eq!(storage[0].device_type, "SD");
        assert_eq!(storage[0].ts_ms, samples[0].ts_ms);

        let text = String::from_utf8(metrics.encode_metrics().unwrap()).unwrap();
        assert!(text.contains("rpimon_cpu_load1 0.42"));
        assert!(text.contains("rpimon_storage_alerts_total{device_type=\"SD\"}"));

        let after_stop = samples.len();
        tokio::time::sleep(Duration::from_millis(150)).await;
        let samples = store.query_samples(SampleQuery::Latest { limit: 100 }).unwrap();
        assert_eq!(samples.len(), after_stop);
    }

    #[tokio::test]
    async fn failed_ticks_do_not_stop_the_schedule() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metrics.db");
        let store = Store::open(&path).unwrap();
        Connection::open(&path)
            .unwrap()
            .execute_batch("DROP TABLE metrics;")
            .unwrap();

        let metrics = Metrics::new().unwrap();
        let recorder = MetricsRecorder::new(collector(), store.clone(), Duration::from_millis(40))
            .with_metrics(metrics.clone());
        recorder.start();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(recorder.is_running());

        Store::open(&path).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        recorder.stop().await;

        let rows = store.query_samples(SampleQuery::Latest { limit: 100 }).unwrap();
        assert!(!rows.is_empty());
        let text = String::from_utf8(metrics.encode_metrics().unwrap()).unwrap();
        assert!(text.contains("rpimon_record_errors_total{stage=\"store\"}"));
    }

    #[tokio::test]
    async fn failed_storage_write_leaves_no_sample_row() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metrics.db");
        let store = Store::open(&path).unwrap();
        Connection::open(&path)
            .unwrap()
            .execute_batch("DROP TABLE storage_metrics;")
            .unwrap();

        let tick = Tick {
            collector: collector(),
            store: store.clone(),
            metrics: None,
        };
        let err = tick.run().await.unwrap_err();
        assert_eq!(err.stage(), "store");

        let rows = store.query_samples(SampleQuery::Latest { limit: 10 }).unwrap();
        assert!(rows.is_empty());
    }
}
