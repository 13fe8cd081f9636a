//! Interface byte counters and the bandwidth delta between two collections.

use crate::collectors::{CounterMap, InterfaceCounters, NetworkCounterSource};
use crate::format::format_bitrate;
use crate::snapshot::{now_unix_ms, InterfaceBandwidth, NetworkReport};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use sysinfo::Networks;
use tokio::sync::Mutex;
use tracing::debug;

/// `/proc/net/dev`, falling back to sysinfo's interface totals.
pub struct LocalCounters {
    path: PathBuf,
}

impl LocalCounters {
    pub fn new() -> Self {
        Self::with_path("/proc/net/dev")
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for LocalCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkCounterSource for LocalCounters {
    fn read_counters(&self) -> Option<CounterMap> {
        match fs::read_to_string(&self.path) {
            Ok(text) => return Some(parse_proc_net_dev(&text)),
            Err(err) => {
                debug!(
                    path = %self.path.display(),
                    error = %err,
                    "net counters unavailable, using sysinfo"
                );
            }
        }

        let networks = Networks::new_with_refreshed_list();
        let counters: CounterMap = networks
            .iter()
            .map(|(name, data)| {
                (
                    name.to_string(),
                    InterfaceCounters {
                        rx_bytes: data.total_received(),
                        tx_bytes: data.total_transmitted(),
                    },
                )
            })
            .collect();
        if counters.is_empty() {
            None
        } else {
            Some(counters)
        }
    }
}

/// Two header lines, then `iface: rx_bytes rx_packets ... tx_bytes ...`; receive bytes are the
/// first counter and transmit bytes the ninth.
pub fn parse_proc_net_dev(text: &str) -> CounterMap {
    text.lines()
        .skip(2)
        .filter_map(|line| {
            let (name, rest) = line.split_once(':')?;
            let fields: Vec<&str> = rest.split_whitespace().collect();
            if fields.len() < 9 {
                return None;
            }
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((
                name.to_string(),
                InterfaceCounters {
                    rx_bytes: fields[0].parse().unwrap_or(0),
                    tx_bytes: fields[8].parse().unwrap_or(0),
                },
            ))
        })
        .collect()
}

/// Counters from the previous collection and when they were read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkCounterState {
    pub counters: CounterMap,
    pub timestamp_ms: i64,
}

/// Per-interface rates against `previous`. Interfaces without a baseline, a non-positive elapsed
/// time and counters that went backwards all report zero for this interval.
pub fn compute_bandwidth(
    previous: Option<&NetworkCounterState>,
    current: &CounterMap,
    now_ms: i64,
) -> NetworkReport {
    let elapsed_s = previous
        .map(|p| (now_ms - p.timestamp_ms) as f64 / 1000.0)
        .unwrap_or(0.0);

    let mut report = NetworkReport::default();
    for (name, cur) in current {
        let prev = previous.and_then(|p| p.counters.get(name));
        let (rx_bps, tx_bps) = match prev {
            Some(prev) if elapsed_s > 0.0 => (
                rate_bps(prev.rx_bytes, cur.rx_bytes, elapsed_s),
                rate_bps(prev.tx_bytes, cur.tx_bytes, elapsed_s),
            ),
            _ => (0.0, 0.0),
        };

        if name != "lo" {
            report.total_rx_bps += rx_bps;
            report.total_tx_bps += tx_bps;
            report.total_rx_bytes = report.total_rx_bytes.saturating_add(cur.rx_bytes);
            report.total_tx_bytes = report.total_tx_bytes.saturating_add(cur.tx_bytes);
        }

        report.interfaces.insert(
            name.clone(),
            InterfaceBandwidth {
                rx: format_bitrate(rx_bps),
                tx: format_bitrate(tx_bps),
                rx_bps,
                tx_bps,
                rx_bytes: cur.rx_bytes,
                tx_bytes: cur.tx_bytes,
            },
        );
    }
    report
}

fn rate_bps(prev: u64, cur: u64, elapsed_s: f64) -> f64 {
    if cur < prev {
        return 0.0;
    }
    (cur - prev) as f64 / elapsed_s * 8.0
}

type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// Owns the counter state between collections.
pub struct NetworkMeter {
    source: Arc<dyn NetworkCounterSource>,
    clock: Clock,
    state: Mutex<Option<NetworkCounterState>>,
}

impl NetworkMeter {
    pub fn new(source: Arc<dyn NetworkCounterSource>) -> Self {
        Self::with_clock(source, Arc::new(now_unix_ms))
    }

    pub fn with_clock(source: Arc<dyn NetworkCounterSource>, clock: Clock) -> Self {
        Self {
            source,
            clock,
            state: Mutex::new(None),
        }
    }

    /// Reads counters, computes rates and replaces the stored state under one lock, so
    /// concurrent callers never interleave a read with another caller's update. The counter
    /// read itself runs on the blocking pool.
    pub async fn measure(&self) -> NetworkReport {
        let mut state = self.state.lock().await;
        let source = self.source.clone();
        let current = match tokio::task::spawn_blocking(move || source.read_counters()).await {
            Ok(counters) => counters.unwrap_or_default(),
            Err(err) => {
                debug!(error = %err, "network counter read failed");
                CounterMap::new()
            }
        };
        let now_ms = (self.clock)();
        let report = compute_bandwidth(state.as_ref(), &current, now_ms);
        *state = Some(NetworkCounterState {
            counters: current,
            timestamp_ms: now_ms,
        });
        report
    }
}
