use serde::{Deserialize, Serialize};

use crate::stats::TrendMode;

pub const MIN_THRESHOLD_DAYS: f64 = 0.5;
pub const MAX_WINDOW_DAYS: i64 = 90;
pub const MAX_DISPATCH_CONCURRENCY: i64 = 64;
pub const DEFAULT_DISPATCH_CONCURRENCY: i64 = 16;

/// Runtime policy, persisted in `app_settings` and editable over HTTP.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolicySettings {
    pub inactivity_threshold_days: f64,
    pub stats_window_days: i64,
    pub dispatch_concurrency: i64,
    pub clear_invalid_tokens: bool,
    pub trend_mode: TrendMode,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            inactivity_threshold_days: 3.0,
            stats_window_days: 7,
            dispatch_concurrency: DEFAULT_DISPATCH_CONCURRENCY,
            clear_invalid_tokens: false,
            trend_mode: TrendMode::PreviousPeriod,
        }
    }
}

impl PolicySettings {
    pub fn normalized(self) -> Self {
        let threshold = if self.inactivity_threshold_days.is_finite() {
            self.inactivity_threshold_days.max(MIN_THRESHOLD_DAYS)
        } else {
            PolicySettings::default().inactivity_threshold_days
        };
        Self {
            inactivity_threshold_days: threshold,
            stats_window_days: self.stats_window_days.clamp(1, MAX_WINDOW_DAYS),
            dispatch_concurrency: self.dispatch_concurrency.clamp(1, MAX_DISPATCH_CONCURRENCY),
            clear_invalid_tokens: self.clear_invalid_tokens,
            trend_mode: self.trend_mode,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct SettingsUpdate {
    #[serde(default)]
    pub inactivity_threshold_days: Option<f64>,
    #[serde(default)]
    pub stats_window_days: Option<i64>,
    #[serde(default)]
    pub dispatch_concurrency: Option<i64>,
    #[serde(default)]
    pub clear_invalid_tokens: Option<bool>,
    #[serde(default)]
    pub trend_mode: Option<TrendMode>,
}

impl SettingsUpdate {
    pub fn is_empty(&self) -> bool {
        self.inactivity_threshold_days.is_none()
            && self.stats_window_days.is_none()
            && self.dispatch_concurrency.is_none()
            && self.clear_invalid_tokens.is_none()
            && self.trend_mode.is_none()
    }

    pub fn apply(&self, current: PolicySettings) -> PolicySettings {
        PolicySettings {
            inactivity_threshold_days: self
                .inactivity_threshold_days
                .unwrap_or(current.inactivity_threshold_days),
            stats_window_days: self.stats_window_days.unwrap_or(current.stats_window_days),
            dispatch_concurrency: self.dispatch_concurrency.unwrap_or(current.dispatch_concurrency),
            clear_invalid_tokens: self.clear_invalid_tokens.unwrap_or(current.clear_invalid_tokens),
            trend_mode: self.trend_mode.unwrap_or(current.trend_mode),
        }
        .normalized()
    }
}
