use crate::alerts::AlertThreshold;
use crate::collectors::command::run_command;
use crate::collectors::{DiskUsageSource, MountedDevice, StorageSource};
use crate::format::format_bytes;
use crate::snapshot::{DeviceClass, DiskUsage, StorageDevice};
use async_trait::async_trait;
use std::collections::HashSet;
use std::time::Duration;
use sysinfo::Disks;
use tracing::debug;

/// Root filesystem usage from POSIX `df`, in 1K blocks.
pub struct DfRoot {
    timeout: Duration,
}

impl DfRoot {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl DiskUsageSource for DfRoot {
    async fn root_usage(&self) -> Option<DiskUsage> {
        let out = run_command("df", &["-Pk", "/"], self.timeout).await?;
        parse_df_root(&out)
    }
}

/// Last line of `df -Pk`: `fs 1024-blocks used available capacity mount`.
pub fn parse_df_root(out: &str) -> Option<DiskUsage> {
    let line = out.lines().rev().find(|l| !l.trim().is_empty())?;
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 6 {
        return None;
    }
    let total_kb = fields[1].parse::<u64>().ok()?;
    let capacity = fields[4];
    let used_percent = capacity.trim_end_matches('%').parse::<f64>().ok()?;
    let size_bytes = total_kb.saturating_mul(1024);
    Some(DiskUsage {
        used: capacity.to_string(),
        size: format_bytes(size_bytes),
        used_percent,
        size_bytes,
    })
}

/// sysinfo's view of the `/` mount.
pub struct SysinfoRoot;

#[async_trait]
impl DiskUsageSource for SysinfoRoot {
    async fn root_usage(&self) -> Option<DiskUsage> {
        let mounts = list_mounts().await;
        let root = mounts.into_iter().find(|d| d.mount == "/")?;
        if root.total_bytes == 0 {
            return None;
        }
        let used = root.total_bytes.saturating_sub(root.available_bytes);
        let used_percent = (used as f64 / root.total_bytes as f64 * 100.0).ceil();
        Some(DiskUsage {
            used: format!("{used_percent:.0}%"),
            size: format_bytes(root.total_bytes),
            used_percent,
            size_bytes: root.total_bytes,
        })
    }
}

pub struct SysinfoMounts;

#[async_trait]
impl StorageSource for SysinfoMounts {
    async fn mounted_devices(&self) -> Vec<MountedDevice> {
        list_mounts().await
    }
}

async fn list_mounts() -> Vec<MountedDevice> {
    let result = tokio::task::spawn_blocking(|| {
        Disks::new_with_refreshed_list()
            .iter()
            .map(|disk| MountedDevice {
                fs: disk.name().to_string_lossy().to_string(),
                mount: disk.mount_point().to_string_lossy().to_string(),
                total_bytes: disk.total_space(),
                available_bytes: disk.available_space(),
            })
            .collect::<Vec<_>>()
    })
    .await;

    match result {
        Ok(mounts) => mounts,
        Err(err) => {
            debug!(error = %err, "mount listing task failed");
            Vec::new()
        }
    }
}

/// SD cards are `mmcblk*`; SATA, USB, NVMe and IDE disks are `HDD`. Anything else is ignored.
pub fn classify_device(fs: &str) -> Option<DeviceClass> {
    let name = fs.strip_prefix("/dev/")?;
    if name.starts_with("mmcblk") {
        Some(DeviceClass::Sd)
    } else if name.starts_with("sd") || name.starts_with("nvme") || name.starts_with("hd") {
        Some(DeviceClass::Hdd)
    } else {
        None
    }
}

/// Monitored devices, one entry per block device (its first mount), sorted by class then name.
pub fn storage_devices(
    mounts: Vec<MountedDevice>,
    threshold: &AlertThreshold,
) -> Vec<StorageDevice> {
    let mut seen = HashSet::new();
    let mut out: Vec<StorageDevice> = mounts
        .into_iter()
        .filter_map(|m| {
            let class = classify_device(&m.fs)?;
            if m.total_bytes == 0 || !seen.insert(m.fs.clone()) {
                return None;
            }
            let used_bytes = m.total_bytes.saturating_sub(m.available_bytes);
            let use_percent =
                ((used_bytes as f64 / m.total_bytes as f64) * 1000.0).round() / 10.0;
            Some(StorageDevice {
                fs: m.fs,
                mount: m.mount,
                class,
                total_bytes: m.total_bytes,
                used_bytes,
                use_percent,
                alert: threshold.classify(use_percent),
            })
        })
        .collect();
    out.sort_by(|a, b| (a.class.as_str(), &a.fs).cmp(&(b.class.as_str(), &b.fs)));
    out
}
