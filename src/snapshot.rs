use crate::alerts::AlertLevel;
use crate::format::ThrottlingStatus;
use crate::transmission::{SessionSummary, TransferItem};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

pub const NOT_AVAILABLE: &str = "N/A";
pub const PUBLIC_IP_UNAVAILABLE: &str = "Unable to fetch";

pub fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// One consistent reading of the host. Every field carries a neutral value when its source failed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Snapshot {
    pub timestamp_ms: i64,
    pub cpu: CpuLoad,
    pub uptime: Uptime,
    pub memory: MemoryStat,
    pub disk: DiskUsage,
    pub storage: Vec<StorageDevice>,
    pub temperature: Temperatures,
    pub network: NetworkReport,
    pub ip_addresses: IpAddresses,
    pub throttling: ThrottlingStatus,
    pub transmission: TransmissionReport,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CpuLoad {
    pub load1: f64,
    pub load5: f64,
    pub load15: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Uptime {
    pub seconds: u64,
    pub formatted: String,
}

/// Megabyte figures as reported by `free -m`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MemoryStat {
    pub total_mb: u64,
    pub used_mb: u64,
    pub free_mb: u64,
    pub available_mb: u64,
    pub shared_mb: u64,
    pub buffers_mb: u64,
    pub cached_mb: u64,
    pub buff_cache_mb: u64,
    pub used_percent: f64,
    pub swap_total_mb: u64,
    pub swap_used_mb: u64,
    pub alert: AlertLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiskUsage {
    /// Percent string as `df` prints it, e.g. `45%`.
    pub used: String,
    pub size: String,
    pub used_percent: f64,
    pub size_bytes: u64,
}

impl Default for DiskUsage {
    fn default() -> Self {
        Self {
            used: NOT_AVAILABLE.to_string(),
            size: NOT_AVAILABLE.to_string(),
            used_percent: 0.0,
            size_bytes: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DeviceClass {
    #[serde(rename = "HDD")]
    Hdd,
    #[serde(rename = "SD")]
    Sd,
}

impl DeviceClass {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceClass::Hdd => "HDD",
            DeviceClass::Sd => "SD",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "HDD" => Some(DeviceClass::Hdd),
            "SD" => Some(DeviceClass::Sd),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorageDevice {
    pub fs: String,
    pub mount: String,
    pub class: DeviceClass,
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub use_percent: f64,
    pub alert: AlertLevel,
}

#[derive(Debug, Clone, Serialize)]
pub struct Temperatures {
    pub cpu: String,
    pub gpu: String,
}

impl Default for Temperatures {
    fn default() -> Self {
        Self {
            cpu: NOT_AVAILABLE.to_string(),
            gpu: NOT_AVAILABLE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InterfaceBandwidth {
    pub rx: String,
    pub tx: String,
    pub rx_bps: f64,
    pub tx_bps: f64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NetworkReport {
    pub interfaces: BTreeMap<String, InterfaceBandwidth>,
    pub total_rx_bps: f64,
    pub total_tx_bps: f64,
    pub total_rx_bytes: u64,
    pub total_tx_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterfaceAddress {
    pub interface: String,
    pub address: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LocalAddresses {
    pub ipv4: Vec<InterfaceAddress>,
    pub ipv6: Vec<InterfaceAddress>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IpAddresses {
    pub public: String,
    pub local: LocalAddresses,
}

impl Default for IpAddresses {
    fn default() -> Self {
        Self {
            public: PUBLIC_IP_UNAVAILABLE.to_string(),
            local: LocalAddresses::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TransmissionReport {
    pub enabled: bool,
    pub error: Option<String>,
    pub session: Option<SessionSummary>,
    pub active: Vec<TransferItem>,
}

impl TransmissionReport {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn unreachable() -> Self {
        Self {
            enabled: true,
            error: Some("Unable to reach Transmission RPC".to_string()),
            session: None,
            active: Vec::new(),
        }
    }
}
