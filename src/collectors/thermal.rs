use crate::collectors::command::run_command;
use crate::collectors::{parse_f64_loose, TemperatureSource, ThrottlingSource};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::debug;

/// Single sysfs thermal zone, reported in millidegrees.
pub struct ThermalZone {
    path: PathBuf,
}

impl ThermalZone {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for ThermalZone {
    fn default() -> Self {
        Self::new("/sys/class/thermal/thermal_zone0/temp")
    }
}

#[async_trait]
impl TemperatureSource for ThermalZone {
    async fn celsius(&self) -> Option<f64> {
        read_millidegrees(&self.path).await
    }
}

/// First readable `temp*_input` under `/sys/class/hwmon`, in directory order.
pub struct Hwmon {
    root: PathBuf,
}

impl Hwmon {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Default for Hwmon {
    fn default() -> Self {
        Self::new("/sys/class/hwmon")
    }
}

#[async_trait]
impl TemperatureSource for Hwmon {
    async fn celsius(&self) -> Option<f64> {
        let mut inputs = Vec::new();
        let mut monitors = fs::read_dir(&self.root).await.ok()?;
        while let Ok(Some(monitor)) = monitors.next_entry().await {
            let Ok(mut files) = fs::read_dir(monitor.path()).await else {
                continue;
            };
            while let Ok(Some(file)) = files.next_entry().await {
                let name = file.file_name().to_string_lossy().to_string();
                if name.starts_with("temp") && name.ends_with("_input") {
                    inputs.push(file.path());
                }
            }
        }
        inputs.sort();

        for input in inputs {
            if let Some(c) = read_millidegrees(&input).await {
                return Some(c);
            }
        }
        None
    }
}

async fn read_millidegrees(path: &Path) -> Option<f64> {
    let raw = match fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(err) => {
            debug!(path = %path.display(), error = %err, "temperature unavailable");
            return None;
        }
    };
    let milli = raw.trim().parse::<f64>().ok()?;
    let celsius = milli / 1000.0;
    (celsius.is_finite() && celsius > 0.0).then_some(celsius)
}

/// Raspberry Pi firmware query: `temp=48.3'C`.
pub struct Vcgencmd {
    timeout: Duration,
}

impl Vcgencmd {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl TemperatureSource for Vcgencmd {
    async fn celsius(&self) -> Option<f64> {
        let out = run_command("vcgencmd", &["measure_temp"], self.timeout).await?;
        parse_vcgencmd_temp(&out)
    }
}

pub fn parse_vcgencmd_temp(out: &str) -> Option<f64> {
    let value = out.trim().strip_prefix("temp=").unwrap_or(out.trim());
    parse_f64_loose(value).filter(|c| c.is_finite() && *c > 0.0)
}

pub struct NvidiaSmi {
    timeout: Duration,
}

impl NvidiaSmi {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl TemperatureSource for NvidiaSmi {
    async fn celsius(&self) -> Option<f64> {
        let out = run_command(
            "nvidia-smi",
            &["--query-gpu=temperature.gpu", "--format=csv,noheader,nounits"],
            self.timeout,
        )
        .await?;
        parse_nvidia_smi_temp(&out)
    }
}

/// First positive reading, one GPU per line.
pub fn parse_nvidia_smi_temp(out: &str) -> Option<f64> {
    out.lines()
        .filter_map(parse_f64_loose)
        .find(|c| c.is_finite() && *c > 0.0)
}

pub struct VcgencmdThrottling {
    timeout: Duration,
}

impl VcgencmdThrottling {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ThrottlingSource for VcgencmdThrottling {
    async fn raw_status(&self) -> Option<String> {
        run_command("vcgencmd", &["get_throttled"], self.timeout).await
    }
}
