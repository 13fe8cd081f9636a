use crate::snapshot::StorageDevice;
use crate::store::Sample;
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, GaugeVec, Registry, TextEncoder};
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub cpu_load1: Gauge,
    pub cpu_load5: Gauge,
    pub cpu_load15: Gauge,
    pub mem_total_mb: Gauge,
    pub mem_used_mb: Gauge,
    pub mem_free_mb: Gauge,
    pub mem_available_mb: Gauge,
    pub mem_used_pct: Gauge,
    pub swap_total_mb: Gauge,
    pub swap_used_mb: Gauge,
    pub disk_used_pct: Gauge,
    pub disk_size_bytes: Gauge,
    pub net_rx_bps: Gauge,
    pub net_tx_bps: Gauge,
    pub tx_active_torrents: Gauge,
    pub tx_download_bps: Gauge,
    pub tx_upload_bps: Gauge,
    pub storage_use_percent: GaugeVec,
    pub last_record_timestamp_seconds: Gauge,
    pub scrape_count_total: Counter,
    pub record_errors_total: CounterVec,
    pub storage_alerts_total: CounterVec,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let cpu_load1 = Gauge::with_opts(opts!("rpimon_cpu_load1", "1 minute load average"))?;
        let cpu_load5 = Gauge::with_opts(opts!("rpimon_cpu_load5", "5 minute load average"))?;
        let cpu_load15 = Gauge::with_opts(opts!("rpimon_cpu_load15", "15 minute load average"))?;
        let mem_total_mb = Gauge::with_opts(opts!("rpimon_mem_total_mb", "Total memory in MB"))?;
        let mem_used_mb = Gauge::with_opts(opts!(
            "rpimon_mem_used_mb",
            "Used memory in MB (total minus available)"
        ))?;
        let mem_free_mb = Gauge::with_opts(opts!("rpimon_mem_free_mb", "Free memory in MB"))?;
        let mem_available_mb = Gauge::with_opts(opts!(
            "rpimon_mem_available_mb",
            "Available memory in MB"
        ))?;
        let mem_used_pct =
            Gauge::with_opts(opts!("rpimon_mem_used_pct", "Used memory in percent"))?;
        let swap_total_mb = Gauge::with_opts(opts!("rpimon_swap_total_mb", "Total swap in MB"))?;
        let swap_used_mb = Gauge::with_opts(opts!("rpimon_swap_used_mb", "Used swap in MB"))?;
        let disk_used_pct = Gauge::with_opts(opts!(
            "rpimon_disk_used_pct",
            "Root filesystem usage in percent"
        ))?;
        let disk_size_bytes = Gauge::with_opts(opts!(
            "rpimon_disk_size_bytes",
            "Root filesystem size in bytes"
        ))?;
        let net_rx_bps = Gauge::with_opts(opts!(
            "rpimon_net_rx_bps",
            "Aggregate receive rate in bits per second"
        ))?;
        let net_tx_bps = Gauge::with_opts(opts!(
            "rpimon_net_tx_bps",
            "Aggregate transmit rate in bits per second"
        ))?;
        let tx_active_torrents = Gauge::with_opts(opts!(
            "rpimon_tx_active_torrents",
            "Active Transmission torrents"
        ))?;
        let tx_download_bps = Gauge::with_opts(opts!(
            "rpimon_tx_download_bps",
            "Transmission download rate in bits per second"
        ))?;
        let tx_upload_bps = Gauge::with_opts(opts!(
            "rpimon_tx_upload_bps",
            "Transmission upload rate in bits per second"
        ))?;
        let storage_use_percent = GaugeVec::new(
            opts!(
                "rpimon_storage_use_percent",
                "Usage in percent by monitored block device"
            ),
            &["device_fs", "mount", "device_type"],
        )?;
        let last_record_timestamp_seconds = Gauge::with_opts(opts!(
            "rpimon_last_record_timestamp_seconds",
            "Unix timestamp of the last recorded sample"
        ))?;
        let scrape_count_total = Counter::with_opts(opts!(
            "rpimon_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;
        let record_errors_total = CounterVec::new(
            opts!(
                "rpimon_record_errors_total",
                "Recorder tick failures by stage"
            ),
            &["stage"],
        )?;
        let storage_alerts_total = CounterVec::new(
            opts!(
                "rpimon_storage_alerts_total",
                "Critical storage alerts logged, by device type"
            ),
            &["device_type"],
        )?;

        register(&registry, &cpu_load1)?;
        register(&registry, &cpu_load5)?;
        register(&registry, &cpu_load15)?;
        register(&registry, &mem_total_mb)?;
        register(&registry, &mem_used_mb)?;
        register(&registry, &mem_free_mb)?;
        register(&registry, &mem_available_mb)?;
        register(&registry, &mem_used_pct)?;
        register(&registry, &swap_total_mb)?;
        register(&registry, &swap_used_mb)?;
        register(&registry, &disk_used_pct)?;
        register(&registry, &disk_size_bytes)?;
        register(&registry, &net_rx_bps)?;
        register(&registry, &net_tx_bps)?;
        register(&registry, &tx_active_torrents)?;
        register(&registry, &tx_download_bps)?;
        register(&registry, &tx_upload_bps)?;
        register(&registry, &storage_use_percent)?;
        register(&registry, &last_record_timestamp_seconds)?;
        register(&registry, &scrape_count_total)?;
        register(&registry, &record_errors_total)?;
        register(&registry, &storage_alerts_total)?;

        Ok(Arc::new(Self {
            registry,
            cpu_load1,
            cpu_load5,
            cpu_load15,
            mem_total_mb,
            mem_used_mb,
            mem_free_mb,
            mem_available_mb,
            mem_used_pct,
            swap_total_mb,
            swap_used_mb,
            disk_used_pct,
            disk_size_bytes,
            net_rx_bps,
            net_tx_bps,
            tx_active_torrents,
            tx_download_bps,
            tx_upload_bps,
            storage_use_percent,
            last_record_timestamp_seconds,
            scrape_count_total,
            record_errors_total,
            storage_alerts_total,
        }))
    }

    pub fn update_from_sample(&self, sample: &Sample) {
        self.cpu_load1.set(sample.cpu_load1);
        self.cpu_load5.set(sample.cpu_load5);
        self.cpu_load15.set(sample.cpu_load15);
        self.mem_total_mb.set(sample.mem_total_mb as f64);
        self.mem_used_mb.set(sample.mem_used_mb as f64);
        self.mem_free_mb.set(sample.mem_free_mb as f64);
        self.mem_available_mb.set(sample.mem_available_mb as f64);
        self.mem_used_pct.set(sample.mem_used_pct);
        self.swap_total_mb.set(sample.mem_swap_total_mb as f64);
        self.swap_used_mb.set(sample.mem_swap_used_mb as f64);
        self.disk_used_pct.set(sample.disk_used_percent);
        self.disk_size_bytes.set(sample.disk_size_bytes as f64);
        self.net_rx_bps.set(sample.net_rx_bps);
        self.net_tx_bps.set(sample.net_tx_bps);
        self.tx_active_torrents.set(sample.tx_active_torrents as f64);
        self.tx_download_bps.set(sample.tx_download_bps);
        self.tx_upload_bps.set(sample.tx_upload_bps);
        self.last_record_timestamp_seconds
            .set(sample.ts_ms as f64 / 1000.0);
    }

    /// Replaces the per-device series so unmounted devices drop out.
    pub fn update_storage(&self, devices: &[StorageDevice]) {
        self.storage_use_percent.reset();
        for d in devices {
            self.storage_use_percent
                .with_label_values(&[d.fs.as_str(), d.mount.as_str(), d.class.as_str()])
                .set(d.use_percent);
        }
    }

    pub fn inc_scrape_count(&self) {
        self.scrape_count_total.inc();
    }

    pub fn inc_record_error(&self, stage: &str) {
        self.record_errors_total.with_label_values(&[stage]).inc();
    }

    pub fn inc_storage_alert(&self, device_type: &str) {
        self.storage_alerts_total
            .with_label_values(&[device_type])
            .inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}
