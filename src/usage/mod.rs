//! Usage Store — append-only time series of per-account usage samples.

mod sqlite;

pub use sqlite::SqliteUsageStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Window {
    Primary,
    Secondary,
}

impl Window {
    pub fn as_str(&self) -> &'static str {
        match self {
            Window::Primary => "primary",
            Window::Secondary => "secondary",
        }
    }

    pub fn from_str_lenient(raw: &str) -> Self {
        match raw {
            "primary" => Window::Primary,
            _ => Window::Secondary,
        }
    }
}

/// Upstream never reports a window longer than 24h as `primary`; such a
/// sample is re-classified as `secondary` on read (spec §3 invariant).
pub const PRIMARY_MAX_WINDOW_MINUTES: i64 = 1440;

#[derive(Debug, Clone)]
pub struct UsageSample {
    pub account_id: String,
    pub window: Window,
    pub recorded_at: DateTime<Utc>,
    pub used_percent: f64,
    pub reset_at: Option<DateTime<Utc>>,
    pub window_minutes: i64,
    pub capacity_credits: Option<f64>,
}

impl UsageSample {
    /// Apply the primary/secondary re-classification invariant.
    pub fn normalized(mut self) -> Self {
        if self.window == Window::Primary && self.window_minutes >= PRIMARY_MAX_WINDOW_MINUTES {
            self.window = Window::Secondary;
        }
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct LatestUsage {
    pub primary: Option<UsageSample>,
    pub secondary: Option<UsageSample>,
}

#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn append(&self, sample: UsageSample) -> anyhow::Result<()>;

    async fn latest_by_account(&self, window: Window) -> anyhow::Result<HashMap<String, UsageSample>>;

    /// Single-pass read of the latest primary and secondary sample per
    /// account (spec §4.B: must not be a full-table scan).
    async fn latest_primary_secondary_by_account(
        &self,
    ) -> anyhow::Result<HashMap<String, LatestUsage>>;
}


#[cfg(test)]
pub use memory_store_for_tests::InMemoryUsageStore;
