use crate::alerts::AlertLevel;
use crate::collectors::HostSource;
use crate::snapshot::{CpuLoad, InterfaceAddress, LocalAddresses, MemoryStat};
use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::PathBuf;
use sysinfo::{Networks, System};
use tracing::debug;

/// Load, uptime, memory and local addresses of the running host.
///
/// `/proc` is read first; sysinfo covers hosts without it.
pub struct LocalHost {
    proc_root: PathBuf,
}

impl LocalHost {
    pub fn new() -> Self {
        Self::with_proc_root("/proc")
    }

    pub fn with_proc_root(root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: root.into(),
        }
    }

    fn read_proc(&self, name: &str) -> Option<String> {
        let path = self.proc_root.join(name);
        match fs::read_to_string(&path) {
            Ok(text) => Some(text),
            Err(err) => {
                debug!(path = %path.display(), error = %err, "proc file unavailable");
                None
            }
        }
    }
}

impl Default for LocalHost {
    fn default() -> Self {
        Self::new()
    }
}

impl HostSource for LocalHost {
    fn load(&self) -> Option<CpuLoad> {
        if let Some(load) = self.read_proc("loadavg").as_deref().and_then(parse_loadavg) {
            return Some(load);
        }
        let avg = System::load_average();
        Some(CpuLoad {
            load1: avg.one.max(0.0),
            load5: avg.five.max(0.0),
            load15: avg.fifteen.max(0.0),
        })
    }

    fn uptime_seconds(&self) -> Option<u64> {
        self.read_proc("uptime")
            .as_deref()
            .and_then(parse_uptime)
            .or_else(|| Some(System::uptime()))
    }

    fn memory(&self) -> Option<MemoryStat> {
        self.read_proc("meminfo")
            .as_deref()
            .and_then(parse_meminfo)
            .or_else(sysinfo_memory)
    }

    fn local_addresses(&self) -> LocalAddresses {
        let networks = Networks::new_with_refreshed_list();
        let mut out = LocalAddresses::default();
        for (name, data) in networks.iter() {
            for ip in data.ip_networks() {
                push_address(&mut out, name, ip.addr);
            }
        }
        out.ipv4.sort_by(|a, b| (&a.interface, &a.address).cmp(&(&b.interface, &b.address)));
        out.ipv6.sort_by(|a, b| (&a.interface, &a.address).cmp(&(&b.interface, &b.address)));
        out
    }
}

fn push_address(out: &mut LocalAddresses, interface: &str, addr: IpAddr) {
    if addr.is_loopback() || addr.is_unspecified() {
        return;
    }
    let entry = InterfaceAddress {
        interface: interface.to_string(),
        address: addr.to_string(),
    };
    match addr {
        IpAddr::V4(_) => out.ipv4.push(entry),
        IpAddr::V6(_) => out.ipv6.push(entry),
    }
}

pub fn parse_loadavg(text: &str) -> Option<CpuLoad> {
    let mut parts = text.split_whitespace();
    let mut next = || parts.next().and_then(|v| v.parse::<f64>().ok());
    Some(CpuLoad {
        load1: next()?.max(0.0),
        load5: next()?.max(0.0),
        load15: next()?.max(0.0),
    })
}

pub fn parse_uptime(text: &str) -> Option<u64> {
    let secs = text.split_whitespace().next()?.parse::<f64>().ok()?;
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Some(secs as u64)
}

/// Mirrors `free -m`: `used = total - available`, cache includes `SReclaimable`.
pub fn parse_meminfo(text: &str) -> Option<MemoryStat> {
    let fields: HashMap<&str, u64> = text
        .lines()
        .filter_map(|line| {
            let (key, rest) = line.split_once(':')?;
            let kb = rest.split_whitespace().next()?.parse::<u64>().ok()?;
            Some((key.trim(), kb))
        })
        .collect();

    let kb = |key: &str| fields.get(key).copied().unwrap_or(0);
    let total = *fields.get("MemTotal")?;
    if total == 0 {
        return None;
    }
    let free = kb("MemFree");
    let buffers = kb("Buffers");
    let cached = kb("Cached") + kb("SReclaimable");
    let available = fields
        .get("MemAvailable")
        .copied()
        .unwrap_or_else(|| free + buffers + cached)
        .min(total);
    let used = total - available;
    let swap_total = kb("SwapTotal");
    let swap_used = swap_total.saturating_sub(kb("SwapFree"));

    Some(MemoryStat {
        total_mb: kb_to_mb(total),
        used_mb: kb_to_mb(used),
        free_mb: kb_to_mb(free),
        available_mb: kb_to_mb(available),
        shared_mb: kb_to_mb(kb("Shmem")),
        buffers_mb: kb_to_mb(buffers),
        cached_mb: kb_to_mb(cached),
        buff_cache_mb: kb_to_mb(buffers + cached),
        used_percent: percent_1dp(used, total),
        swap_total_mb: kb_to_mb(swap_total),
        swap_used_mb: kb_to_mb(swap_used),
        alert: AlertLevel::Ok,
    })
}

fn sysinfo_memory() -> Option<MemoryStat> {
    let mut system = System::new();
    system.refresh_memory();
    let total = system.total_memory();
    if total == 0 {
        return None;
    }
    let available = system.available_memory().min(total);
    let used = total - available;
    let free = system.free_memory();
    Some(MemoryStat {
        total_mb: bytes_to_mb(total),
        used_mb: bytes_to_mb(used),
        free_mb: bytes_to_mb(free),
        available_mb: bytes_to_mb(available),
        buff_cache_mb: bytes_to_mb(available.saturating_sub(free)),
        used_percent: percent_1dp(used, total),
        swap_total_mb: bytes_to_mb(system.total_swap()),
        swap_used_mb: bytes_to_mb(system.used_swap()),
        ..MemoryStat::default()
    })
}

fn kb_to_mb(kb: u64) -> u64 {
    kb / 1024
}

fn bytes_to_mb(bytes: u64) -> u64 {
    bytes / 1024 / 1024
}

fn percent_1dp(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    ((part as f64 / whole as f64) * 1000.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEMINFO: &str = "\
MemTotal:        3884376 kB
MemFree:          412000 kB
MemAvailable:    2936832 kB
Buffers:          102400 kB
Cached:          2150400 kB
SwapCached:            0 kB
Shmem:             51200 kB
SReclaimable:      81920 kB
SwapTotal:        102396 kB
SwapFree:          81916 kB
";

    #[test]
    fn meminfo_matches_free_semantics() {
        let m = parse_meminfo(MEMINFO).expect("parse");
        assert_eq!(m.total_mb, 3793);
        assert_eq!(m.available_mb, 2868);
        assert_eq!(m.used_mb, 925);
        assert_eq!(m.free_mb, 402);
        assert_eq!(m.buffers_mb, 100);
        assert_eq!(m.cached_mb, 2180);
        assert_eq!(m.buff_cache_mb, 2280);
        assert_eq!(m.shared_mb, 50);
        assert_eq!(m.swap_total_mb, 99);
        assert_eq!(m.swap_used_mb, 20);
        assert_eq!(m.used_percent, 24.4);
    }

    #[test]
    fn meminfo_without_available_estimates_it() {
        let text = "MemTotal: 1000 kB\nMemFree: 200 kB\nBuffers: 100 kB\nCached: 300 kB\n";
        let m = parse_meminfo(text).expect("parse");
        assert_eq!(m.used_percent, 40.0);
    }

    #[test]
    fn meminfo_without_total_is_none() {
        assert!(parse_meminfo("MemFree: 10 kB\n").is_none());
        assert!(parse_meminfo("").is_none());
    }

    #[test]
    fn loadavg_and_uptime_parse() {
        let load = parse_loadavg("0.52 0.58 0.59 1/389 12345\n").unwrap();
        assert_eq!(load.load1, 0.52);
        assert_eq!(load.load15, 0.59);
        assert!(parse_loadavg("garbage").is_none());

        assert_eq!(parse_uptime("93784.56 350000.12\n"), Some(93784));
        assert_eq!(parse_uptime("-1 0"), None);
    }

    #[test]
    fn proc_root_is_configurable() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("loadavg"), "1.50 1.00 0.50 2/100 42\n").unwrap();
        std::fs::write(dir.path().join("meminfo"), MEMINFO).unwrap();
        let host = LocalHost::with_proc_root(dir.path());

        assert_eq!(host.load().unwrap().load1, 1.5);
        assert_eq!(host.memory().unwrap().total_mb, 3793);
    }

    #[test]
    fn loopback_addresses_are_skipped() {
        let mut out = LocalAddresses::default();
        push_address(&mut out, "lo", "127.0.0.1".parse().unwrap());
        push_address(&mut out, "lo", "::1".parse().unwrap());
        push_address(&mut out, "eth0", "192.168.1.20".parse().unwrap());
        push_address(&mut out, "eth0", "fe80::1".parse().unwrap());
        assert_eq!(out.ipv4.len(), 1);
        assert_eq!(out.ipv4[0].address, "192.168.1.20");
        assert_eq!(out.ipv6.len(), 1);
        assert_eq!(out.ipv6[0].interface, "eth0");
    }
}
