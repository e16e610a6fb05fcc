const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Tunables shared by the data-access services.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceConfig {
    pub default_page_size: usize,
    pub max_page_size: usize,
    pub search_max_batches: usize,
    pub auto_complete_after_ms: i64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            default_page_size: 20,
            max_page_size: 100,
            search_max_batches: 5,
            auto_complete_after_ms: 14 * DAY_MS,
        }
    }
}

impl ServiceConfig {
    pub fn with_auto_complete_days(mut self, days: u32) -> Self {
        self.auto_complete_after_ms = i64::from(days) * DAY_MS;
        self
    }
}
