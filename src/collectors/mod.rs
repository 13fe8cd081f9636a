//! Source adapters. Each one reads a single OS, subprocess, or HTTP source and reports `None` (or
//! an empty value) instead of failing; the collector maps those to neutral snapshot values.

pub mod command;
pub mod disk;
pub mod network;
pub mod public_ip;
pub mod system;
pub mod thermal;

use crate::config::Config;
use crate::snapshot::{CpuLoad, DiskUsage, LocalAddresses, MemoryStat};
use async_trait::async_trait;
use reqwest::Client;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Cumulative byte counters of one interface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterfaceCounters {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

pub type CounterMap = BTreeMap<String, InterfaceCounters>;

/// A mounted filesystem as the OS lists it, before classification.
#[derive(Debug, Clone, PartialEq)]
pub struct MountedDevice {
    pub fs: String,
    pub mount: String,
    pub total_bytes: u64,
    pub available_bytes: u64,
}

pub trait HostSource: Send + Sync {
    fn load(&self) -> Option<CpuLoad>;
    fn uptime_seconds(&self) -> Option<u64>;
    fn memory(&self) -> Option<MemoryStat>;
    fn local_addresses(&self) -> LocalAddresses;
}

pub trait NetworkCounterSource: Send + Sync {
    /// `None` when no counters can be read at all.
    fn read_counters(&self) -> Option<CounterMap>;
}

#[async_trait]
pub trait TemperatureSource: Send + Sync {
    async fn celsius(&self) -> Option<f64>;
}

#[async_trait]
pub trait DiskUsageSource: Send + Sync {
    async fn root_usage(&self) -> Option<DiskUsage>;
}

#[async_trait]
pub trait StorageSource: Send + Sync {
    async fn mounted_devices(&self) -> Vec<MountedDevice>;
}

#[async_trait]
pub trait ThrottlingSource: Send + Sync {
    /// Raw bitmask text such as `throttled=0x50005`.
    async fn raw_status(&self) -> Option<String>;
}

#[async_trait]
pub trait PublicIpSource: Send + Sync {
    async fn public_ip(&self) -> Option<String>;
}

/// Ordered fallback: the first source that yields a value wins.
pub struct FirstOf<S: ?Sized> {
    sources: Vec<Box<S>>,
}

impl<S: ?Sized> FirstOf<S> {
    pub fn new(sources: Vec<Box<S>>) -> Self {
        Self { sources }
    }
}

#[async_trait]
impl TemperatureSource for FirstOf<dyn TemperatureSource> {
    async fn celsius(&self) -> Option<f64> {
        for source in &self.sources {
            if let Some(v) = source.celsius().await {
                return Some(v);
            }
        }
        None
    }
}

#[async_trait]
impl DiskUsageSource for FirstOf<dyn DiskUsageSource> {
    async fn root_usage(&self) -> Option<DiskUsage> {
        for source in &self.sources {
            if let Some(v) = source.root_usage().await {
                return Some(v);
            }
        }
        None
    }
}

/// Every adapter the collector consults, one per snapshot field group.
#[derive(Clone)]
pub struct Sources {
    pub host: Arc<dyn HostSource>,
    pub network: Arc<dyn NetworkCounterSource>,
    pub cpu_temperature: Arc<dyn TemperatureSource>,
    pub gpu_temperature: Arc<dyn TemperatureSource>,
    pub disk: Arc<dyn DiskUsageSource>,
    pub storage: Arc<dyn StorageSource>,
    pub throttling: Arc<dyn ThrottlingSource>,
    pub public_ip: Arc<dyn PublicIpSource>,
}

impl Sources {
    /// Adapters for the local machine.
    ///
    /// Fallback order:
    /// - CPU temperature: `thermal_zone0`, then the first `hwmon` sensor.
    /// - GPU temperature: `vcgencmd measure_temp`, then `nvidia-smi`.
    /// - Root disk: `df -Pk /`, then sysinfo's view of the `/` mount.
    /// - Memory: `/proc/meminfo`, then sysinfo.
    /// - Network counters: `/proc/net/dev`, then sysinfo.
    pub fn local(cfg: &Config, http: Client) -> Self {
        let command_timeout = cfg.timeouts.command();
        Self {
            host: Arc::new(system::LocalHost::new()),
            network: Arc::new(network::LocalCounters::new()),
            cpu_temperature: Arc::new(FirstOf::<dyn TemperatureSource>::new(vec![
                Box::new(thermal::ThermalZone::default()),
                Box::new(thermal::Hwmon::default()),
            ])),
            gpu_temperature: Arc::new(FirstOf::<dyn TemperatureSource>::new(vec![
                Box::new(thermal::Vcgencmd::new(command_timeout)),
                Box::new(thermal::NvidiaSmi::new(command_timeout)),
            ])),
            disk: Arc::new(FirstOf::<dyn DiskUsageSource>::new(vec![
                Box::new(disk::DfRoot::new(command_timeout)),
                Box::new(disk::SysinfoRoot),
            ])),
            storage: Arc::new(disk::SysinfoMounts),
            throttling: Arc::new(thermal::VcgencmdThrottling::new(command_timeout)),
            public_ip: Arc::new(public_ip::IpEcho::new(
                http,
                cfg.public_ip_url.clone(),
                cfg.timeouts.public_ip(),
            )),
        }
    }
}

/// Lenient float parse for tool output (`48.3`, `48,3`, `temp=48.3'C`).
pub(crate) fn parse_f64_loose(input: &str) -> Option<f64> {
    let trimmed = input.trim();
    if let Ok(v) = trimmed.parse::<f64>() {
        return Some(v);
    }

    if let Ok(v) = trimmed.replace(',', ".").parse::<f64>() {
        return Some(v);
    }

    let filtered: String = trimmed
        .chars()
        .skip_while(|c| !(c.is_ascii_digit() || *c == '-'))
        .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == ',' || *c == '-')
        .collect();
    if filtered.is_empty() {
        return None;
    }

    filtered.replace(',', ".").parse::<f64>().ok()
}


#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Option<f64>);

    #[async_trait]
    impl TemperatureSource for Fixed {
        async fn celsius(&self) -> Option<f64> {
            self.0
        }
    }

    #[tokio::test]
    async fn first_of_uses_first_available_value() {
        let chain = FirstOf::<dyn TemperatureSource>::new(vec![
            Box::new(Fixed(None)),
            Box::new(Fixed(Some(51.5))),
            Box::new(Fixed(Some(70.0))),
        ]);
        assert_eq!(chain.celsius().await, Some(51.5));

        let empty = FirstOf::<dyn TemperatureSource>::new(vec![Box::new(Fixed(None))]);
        assert_eq!(empty.celsius().await, None);
    }

    #[test]
    fn loose_float_parsing() {
        assert_eq!(parse_f64_loose("48.3"), Some(48.3));
        assert_eq!(parse_f64_loose(" 48,5 "), Some(48.5));
        assert_eq!(parse_f64_loose("temp=52.1'C"), Some(52.1));
        assert_eq!(parse_f64_loose("n/a"), None);
    }
}
