use serde::Serialize;

const BPS_PER_KBPS: f64 = 1_000.0;
const BPS_PER_MBPS: f64 = 1_000_000.0;
const BPS_PER_GBPS: f64 = 1_000_000_000.0;

/// Largest-unit breakdown: `59s`, `1m 5s`, `1h 0m`, `1d 0h 0m`.
pub fn format_uptime(seconds: u64) -> String {
    let days = seconds / 86_400;
    let hours = (seconds % 86_400) / 3_600;
    let minutes = (seconds % 3_600) / 60;
    let secs = seconds % 60;

    if days > 0 {
        format!("{days}d {hours}h {minutes}m")
    } else if hours > 0 {
        format!("{hours}h {minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m {secs}s")
    } else {
        format!("{secs}s")
    }
}

/// Decimal bitrate with two digits. Negative and non-finite input reads as zero.
pub fn format_bitrate(bps: f64) -> String {
    if !bps.is_finite() || bps < 0.0 {
        return "0.00 bps".to_string();
    }
    if bps >= BPS_PER_GBPS {
        format!("{:.2} Gbps", bps / BPS_PER_GBPS)
    } else if bps >= BPS_PER_MBPS {
        format!("{:.2} Mbps", bps / BPS_PER_MBPS)
    } else if bps >= BPS_PER_KBPS {
        format!("{:.2} Kbps", bps / BPS_PER_KBPS)
    } else {
        format!("{bps:.2} bps")
    }
}

/// Binary byte size, one decimal above bytes: `512 B`, `1.5 KB`, `29.1 GB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["KB", "MB", "GB", "TB", "PB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = "B";
    for next in UNITS {
        if value < 1024.0 {
            break;
        }
        value /= 1024.0;
        unit = next;
    }
    format!("{value:.1} {unit}")
}

pub fn format_celsius(celsius: f64) -> String {
    format!("{celsius:.1}°C")
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ThrottlingFlags {
    pub under_voltage: bool,
    pub frequency_capped: bool,
    pub throttled: bool,
    pub soft_temp_limit: bool,
    pub under_voltage_occurred: bool,
    pub frequency_capped_occurred: bool,
    pub throttled_occurred: bool,
    pub soft_temp_limit_occurred: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThrottlingStatus {
    pub status: String,
    pub flags: ThrottlingFlags,
}

impl Default for ThrottlingStatus {
    fn default() -> Self {
        decode_throttling(0)
    }
}

/// Parses the `vcgencmd get_throttled` value (`0x50005`, `50005`, `throttled=0x50005`).
/// Anything unparsable decodes as an all-clear mask.
pub fn parse_throttling(raw: &str) -> ThrottlingStatus {
    let trimmed = raw.trim();
    let value = trimmed.strip_prefix("throttled=").unwrap_or(trimmed);
    let hex = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    decode_throttling(u32::from_str_radix(hex, 16).unwrap_or(0))
}

pub fn decode_throttling(mask: u32) -> ThrottlingStatus {
    let bit = |n: u32| mask & (1 << n) != 0;
    let flags = ThrottlingFlags {
        under_voltage: bit(0),
        frequency_capped: bit(1),
        throttled: bit(2),
        soft_temp_limit: bit(3),
        under_voltage_occurred: bit(16),
        frequency_capped_occurred: bit(17),
        throttled_occurred: bit(18),
        soft_temp_limit_occurred: bit(19),
    };

    let active: Vec<&str> = [
        (flags.under_voltage, "Undervoltage"),
        (flags.frequency_capped, "Frequency Capped"),
        (flags.throttled, "Throttled"),
        (flags.soft_temp_limit, "Soft Temp Limit"),
    ]
    .into_iter()
    .filter_map(|(set, label)| set.then_some(label))
    .collect();

    let status = if active.is_empty() {
        "Normal".to_string()
    } else {
        active.join(", ")
    };

    ThrottlingStatus { status, flags }
}
