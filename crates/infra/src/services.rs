use std::sync::Arc;

use anyhow::bail;
use swapboard_domain::chat::ChatService;
use swapboard_domain::collaborations::CollaborationService;
use swapboard_domain::connections::ConnectionService;
use swapboard_domain::error::ServiceResponse;
use swapboard_domain::memory_store::InMemoryDocumentStore;
use swapboard_domain::notifications::NotificationService;
use swapboard_domain::ports::documents::DocumentStore;
use swapboard_domain::ports::telemetry::Telemetry;
use swapboard_domain::realtime::RealtimeService;
use swapboard_domain::trades::TradeService;
use swapboard_domain::users::UserService;

use crate::config::AppConfig;
use crate::metered_store::MeteredDocumentStore;
use crate::telemetry::MetricsTelemetrySink;

#[derive(Clone)]
pub struct AppServices {
    pub config: AppConfig,
    pub store: Arc<dyn DocumentStore>,
    pub notifications: NotificationService,
    pub users: UserService,
    pub trades: TradeService,
    pub collaborations: CollaborationService,
    pub connections: ConnectionService,
    pub chat: ChatService,
    pub realtime: RealtimeService,
}

impl AppServices {
    pub fn in_memory(config: &AppConfig) -> anyhow::Result<Self> {
        if !config.data_backend.eq_ignore_ascii_case("memory") {
            bail!("unsupported data backend: {}", config.data_backend);
        }
        let backend = Arc::new(InMemoryDocumentStore::new());
        let store: Arc<dyn DocumentStore> = Arc::new(MeteredDocumentStore::new(backend.clone()));
        let realtime = RealtimeService::new(backend);
        let telemetry = if config.metrics_enabled {
            Telemetry::new(Arc::new(MetricsTelemetrySink))
        } else {
            Telemetry::disabled()
        };
        Ok(Self::with_store(config, store, telemetry, realtime))
    }

    pub fn with_store(
        config: &AppConfig,
        store: Arc<dyn DocumentStore>,
        telemetry: Telemetry,
        realtime: RealtimeService,
    ) -> Self {
        let service_config = config.service_config();
        let notifications = NotificationService::new(store.clone(), service_config.clone());
        Self {
            config: config.clone(),
            users: UserService::new(store.clone(), service_config.clone()),
            trades: TradeService::new(
                store.clone(),
                notifications.clone(),
                telemetry.clone(),
                service_config.clone(),
            ),
            collaborations: CollaborationService::new(
                store.clone(),
                notifications.clone(),
                telemetry,
                service_config,
            ),
            connections: ConnectionService::new(store.clone(), notifications.clone()),
            chat: ChatService::new(store.clone(), notifications.clone()),
            notifications,
            realtime,
            store,
        }
    }

    /// Auto-completes overdue trades, answering with the `{data, error}` envelope.
    pub async fn sweep_overdue_trades(&self, now: i64) -> ServiceResponse<Vec<String>> {
        ServiceResponse::from_result(
            "auto_complete_overdue",
            self.trades.auto_complete_overdue(now).await,
        )
    }
}
