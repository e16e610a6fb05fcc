use serde::Deserialize;
use swapboard_domain::config::ServiceConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub app_env: String,
    pub log_level: String,
    pub data_backend: String,
    pub default_page_size: usize,
    pub max_page_size: usize,
    pub trade_search_max_batches: usize,
    pub trade_auto_complete_days: u32,
    pub worker_poll_interval_ms: u64,
    pub metrics_enabled: bool,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        dotenvy::dotenv().ok();
        let cfg = config::Config::builder()
            .set_default("app_env", "development")?
            .set_default("log_level", "info")?
            .set_default("data_backend", "memory")?
            .set_default("default_page_size", 20)?
            .set_default("max_page_size", 100)?
            .set_default("trade_search_max_batches", 5)?
            .set_default("trade_auto_complete_days", 14)?
            .set_default("worker_poll_interval_ms", 60_000)?
            .set_default("metrics_enabled", true)?
            .add_source(config::Environment::default().separator("__"))
            .build()?;
        cfg.try_deserialize()
    }

    pub fn is_production(&self) -> bool {
        self.app_env.eq_ignore_ascii_case("production")
    }

    pub fn service_config(&self) -> ServiceConfig {
        let max_page_size = self.max_page_size.max(1);
        ServiceConfig {
            default_page_size: self.default_page_size.clamp(1, max_page_size),
            max_page_size,
            search_max_batches: self.trade_search_max_batches.max(1),
            ..ServiceConfig::default()
        }
        .with_auto_complete_days(self.trade_auto_complete_days)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app_env: "development".into(),
            log_level: "info".into(),
            data_backend: "memory".into(),
            default_page_size: 20,
            max_page_size: 100,
            trade_search_max_batches: 5,
            trade_auto_complete_days: 14,
            worker_poll_interval_ms: 60_000,
            metrics_enabled: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_config_clamps_page_sizes() {
        let config = AppConfig {
            default_page_size: 500,
            max_page_size: 50,
            trade_search_max_batches: 0,
            trade_auto_complete_days: 1,
            ..AppConfig::default()
        };
        let service = config.service_config();
        assert_eq!(service.default_page_size, 50);
        assert_eq!(service.max_page_size, 50);
        assert_eq!(service.search_max_batches, 1);
        assert_eq!(service.auto_complete_after_ms, 24 * 60 * 60 * 1000);
    }
}
