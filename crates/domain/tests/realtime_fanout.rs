use std::sync::{Arc, Mutex};

use swapboard_domain::config::ServiceConfig;
use swapboard_domain::connections::ConnectionService;
use swapboard_domain::memory_store::InMemoryDocumentStore;
use swapboard_domain::notifications::NotificationService;
use swapboard_domain::realtime::{
    RealtimeService, RealtimeUpdate, SubscriberCallback, SubscriberError, SubscriberFilter,
    UpdateType,
};

fn recorder() -> (Arc<Mutex<Vec<RealtimeUpdate>>>, SubscriberCallback) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let callback: SubscriberCallback =
        Arc::new(move |update: &RealtimeUpdate| -> Result<(), SubscriberError> {
            sink.lock().unwrap().push(update.clone());
            Ok(())
        });
    (seen, callback)
}

#[tokio::test]
async fn user_filter_selects_updates_for_that_user_only() {
    let store = Arc::new(InMemoryDocumentStore::new());
    let notifications = NotificationService::new(store.clone(), ServiceConfig::default());
    let connections = ConnectionService::new(store.clone(), notifications);
    let realtime = RealtimeService::new(store.clone());

    let (for_a, callback_a) = recorder();
    let (for_b, callback_b) = recorder();
    realtime.subscribe("a", callback_a, SubscriberFilter::for_users(["u1"]));
    realtime.subscribe("b", callback_b, SubscriberFilter::for_users(["u3"]));
    realtime.watch_social_stats("u1").unwrap();
    realtime.watch_social_stats("u2").unwrap();
    realtime.watch_notifications("u1").unwrap();

    let request = connections
        .send_connection_request("u2", "u1", None)
        .await
        .unwrap();
    connections
        .respond_to_connection("u1", &request.id, true)
        .await
        .unwrap();

    let for_a = for_a.lock().unwrap();
    assert!(!for_a.is_empty());
    assert!(for_a.iter().all(|update| update.user_id.as_deref() == Some("u1")));
    assert!(for_a.iter().any(|update| update.update_type == UpdateType::SocialStats
        && update.payload["connectionCount"] == 1));
    assert!(for_a.iter().any(|update| update.update_type == UpdateType::Notification));
    assert!(for_b.lock().unwrap().is_empty());

    let stats = realtime.stats();
    assert_eq!(stats.active_listeners, 3);
    assert_eq!(stats.errors, 0);
    realtime.cleanup();
    assert_eq!(store.watcher_count(), 0);
}
