use crate::alerts::AlertThreshold;
use crate::collectors::disk::storage_devices;
use crate::collectors::network::NetworkMeter;
use crate::collectors::Sources;
use crate::config::Config;
use crate::format::{format_celsius, format_uptime, parse_throttling, ThrottlingStatus};
use crate::snapshot::{
    now_unix_ms, IpAddresses, Snapshot, Temperatures, TransmissionReport, Uptime, NOT_AVAILABLE,
    PUBLIC_IP_UNAVAILABLE,
};
use crate::transmission::TransmissionClient;
use reqwest::Client;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct CollectorOptions {
    pub command_timeout: Duration,
    pub public_ip_timeout: Duration,
    pub rpc_timeout: Duration,
    pub memory_alerts: AlertThreshold,
    pub storage_alerts: AlertThreshold,
}

impl CollectorOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            command_timeout: cfg.timeouts.command(),
            public_ip_timeout: cfg.timeouts.public_ip(),
            rpc_timeout: cfg.timeouts.rpc(),
            memory_alerts: cfg.alerts.memory,
            storage_alerts: cfg.alerts.storage,
        }
    }
}

/// Builds snapshots from the configured sources. Safe to call from several tasks at once; the
/// network counter state is the only thing shared between calls.
pub struct StatsCollector {
    sources: Sources,
    network: NetworkMeter,
    transmission: Option<Arc<TransmissionClient>>,
    options: CollectorOptions,
}

impl StatsCollector {
    pub fn new(
        sources: Sources,
        transmission: Option<TransmissionClient>,
        options: CollectorOptions,
    ) -> Self {
        Self {
            network: NetworkMeter::new(sources.network.clone()),
            sources,
            transmission: transmission.map(Arc::new),
            options,
        }
    }

    pub fn from_config(cfg: &Config, http: Client) -> Self {
        let transmission =
            TransmissionClient::from_config(&cfg.transmission, cfg.timeouts.rpc(), http.clone());
        Self::new(
            Sources::local(cfg, http),
            transmission,
            CollectorOptions::from_config(cfg),
        )
    }

    #[cfg(test)]
    pub fn transmission_enabled(&self) -> bool {
        self.transmission.is_some()
    }

    /// Never fails: each source that errors or misses its deadline leaves its neutral value.
    pub async fn collect(&self) -> Snapshot {
        let timestamp_ms = now_unix_ms();
        let opts = &self.options;
        let host = self.sources.host.clone();
        let disk = self.sources.disk.clone();
        let storage = self.sources.storage.clone();
        let cpu_temp = self.sources.cpu_temperature.clone();
        let gpu_temp = self.sources.gpu_temperature.clone();
        let throttling = self.sources.throttling.clone();
        let public_ip = self.sources.public_ip.clone();

        let (host, network, disk, mounts, cpu_temp, gpu_temp, throttling, public_ip, transmission) =
            tokio::join!(
                bounded_blocking("host", opts.command_timeout, move || {
                    (host.load(), host.uptime_seconds(), host.memory(), host.local_addresses())
                }),
                self.network.measure(),
                bounded("disk", opts.command_timeout, async move { disk.root_usage().await }),
                bounded("storage", opts.command_timeout, async move {
                    storage.mounted_devices().await
                }),
                bounded("cpu_temperature", opts.command_timeout, async move {
                    cpu_temp.celsius().await
                }),
                bounded("gpu_temperature", opts.command_timeout, async move {
                    gpu_temp.celsius().await
                }),
                bounded("throttling", opts.command_timeout, async move {
                    throttling.raw_status().await
                }),
                bounded("public_ip", opts.public_ip_timeout, async move {
                    public_ip.public_ip().await
                }),
                self.transmission_report(),
            );

        let (cpu, uptime_seconds, memory, local) = host.unwrap_or_default();
        let cpu = cpu.unwrap_or_default();
        let uptime_seconds = uptime_seconds.unwrap_or(0);
        let mut memory = memory.unwrap_or_default();
        memory.alert = opts.memory_alerts.classify(memory.used_percent);

        Snapshot {
            timestamp_ms,
            cpu,
            uptime: Uptime {
                seconds: uptime_seconds,
                formatted: format_uptime(uptime_seconds),
            },
            memory,
            disk: disk.flatten().unwrap_or_default(),
            storage: storage_devices(mounts.unwrap_or_default(), &opts.storage_alerts),
            temperature: Temperatures {
                cpu: celsius_or_na(cpu_temp.flatten()),
                gpu: celsius_or_na(gpu_temp.flatten()),
            },
            network,
            ip_addresses: IpAddresses {
                public: public_ip
                    .flatten()
                    .unwrap_or_else(|| PUBLIC_IP_UNAVAILABLE.to_string()),
                local,
            },
            throttling: throttling
                .flatten()
                .map(|raw| parse_throttling(&raw))
                .unwrap_or_else(ThrottlingStatus::default),
            transmission,
        }
    }

    async fn transmission_report(&self) -> TransmissionReport {
        let Some(client) = self.transmission.clone() else {
            return TransmissionReport::disabled();
        };
        bounded("transmission", self.options.rpc_timeout, async move {
            client.report().await
        })
        .await
        .unwrap_or_else(TransmissionReport::unreachable)
    }
}

fn celsius_or_na(value: Option<f64>) -> String {
    value
        .map(format_celsius)
        .unwrap_or_else(|| NOT_AVAILABLE.to_string())
}

/// Races `fut` against `limit`. The work runs on its own task, so a timeout abandons the result
/// without cancelling the call.
async fn bounded<T, F>(source: &'static str, limit: Duration, fut: F) -> Option<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    await_task(source, limit, tokio::spawn(fut)).await
}

/// Same as [`bounded`] for synchronous reads, which run on the blocking pool.
async fn bounded_blocking<T, F>(source: &'static str, limit: Duration, read: F) -> Option<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    await_task(source, limit, tokio::task::spawn_blocking(read)).await
}

async fn await_task<T>(source: &'static str, limit: Duration, task: JoinHandle<T>) -> Option<T> {
    match time::timeout(limit, task).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(err)) => {
            debug!(source, error = %err, "source task failed");
            None
        }
        Err(_elapsed) => {
            debug!(source, timeout_ms = limit.as_millis() as u64, "source timed out");
            None
        }
    }
}
