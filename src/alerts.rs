use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    #[default]
    Ok,
    Warn,
    Crit,
}

/// Percent-used bands: `[0, warn)` ok, `[warn, crit)` warn, `[crit, ..)` crit.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct AlertThreshold {
    pub warn_percent: f64,
    pub crit_percent: f64,
}

impl AlertThreshold {
    pub const fn new(warn_percent: f64, crit_percent: f64) -> Self {
        Self {
            warn_percent,
            crit_percent,
        }
    }

    pub fn classify(&self, used_percent: f64) -> AlertLevel {
        if used_percent >= self.crit_percent {
            AlertLevel::Crit
        } else if used_percent >= self.warn_percent {
            AlertLevel::Warn
        } else {
            AlertLevel::Ok
        }
    }

    pub fn is_valid(&self) -> bool {
        (0.0..=100.0).contains(&self.warn_percent)
            && (0.0..=100.0).contains(&self.crit_percent)
            && self.warn_percent < self.crit_percent
    }
}

impl Default for AlertThreshold {
    fn default() -> Self {
        Self::new(80.0, 90.0)
    }
}
