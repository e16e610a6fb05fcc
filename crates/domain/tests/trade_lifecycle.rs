use std::sync::Arc;

use swapboard_domain::config::ServiceConfig;
use swapboard_domain::memory_store::InMemoryDocumentStore;
use swapboard_domain::notifications::NotificationService;
use swapboard_domain::ports::telemetry::Telemetry;
use swapboard_domain::trades::{
    CompletionRequestInput, TradeCreate, TradeSearch, TradeService, TradeSkill, TradeStatus,
    TradeVisibility,
};
use swapboard_domain::users::UserService;

struct Harness {
    trades: TradeService,
    users: UserService,
}

fn harness_with(config: ServiceConfig) -> Harness {
    let store = Arc::new(InMemoryDocumentStore::new());
    let notifications = NotificationService::new(store.clone(), config.clone());
    Harness {
        trades: TradeService::new(
            store.clone(),
            notifications,
            Telemetry::disabled(),
            config.clone(),
        ),
        users: UserService::new(store, config),
    }
}

fn harness() -> Harness {
    harness_with(ServiceConfig::default())
}

fn draft(title: &str, skill: &str, visibility: TradeVisibility) -> TradeCreate {
    TradeCreate {
        title: title.into(),
        description: "Skill swap".into(),
        category: "music".into(),
        creator_name: "Ana".into(),
        offered_skills: vec![TradeSkill::new(skill)],
        wanted_skills: vec![TradeSkill::new("Cooking")],
        visibility,
        ..TradeCreate::default()
    }
}

async fn in_progress(harness: &Harness) -> String {
    let trade = harness
        .trades
        .create_trade("u1", draft("Guitar for cooking", "Guitar", TradeVisibility::Public))
        .await
        .unwrap();
    harness.trades.accept_trade("u1", &trade.id, "u2").await.unwrap();
    trade.id
}

#[tokio::test]
async fn private_trades_are_found_by_parties_only() {
    let harness = harness();
    let public = harness
        .trades
        .create_trade("u1", draft("Piano lessons", "Piano", TradeVisibility::Public))
        .await
        .unwrap();
    let private = harness
        .trades
        .create_trade("u1", draft("Violin lessons", "Violin", TradeVisibility::Private))
        .await
        .unwrap();

    let ids = |page: Vec<swapboard_domain::trades::Trade>| {
        let mut ids: Vec<String> = page.into_iter().map(|trade| trade.id).collect();
        ids.sort();
        ids
    };

    let outsider = harness
        .trades
        .search_trades(Some("u9"), TradeSearch::default())
        .await
        .unwrap();
    assert_eq!(ids(outsider.items), vec![public.id.clone()]);

    let anonymous = harness
        .trades
        .search_trades(None, TradeSearch::default())
        .await
        .unwrap();
    assert_eq!(ids(anonymous.items), vec![public.id.clone()]);

    let creator = harness
        .trades
        .search_trades(Some("u1"), TradeSearch::default())
        .await
        .unwrap();
    let mut expected = vec![public.id, private.id];
    expected.sort();
    assert_eq!(ids(creator.items), expected);
}

#[tokio::test]
async fn search_term_matches_title_and_skills() {
    let harness = harness();
    for (title, skill) in [
        ("Piano lessons", "Piano"),
        ("Learn to bake", "Baking"),
        ("Evening sessions", "Jazz Piano"),
    ] {
        harness
            .trades
            .create_trade("u1", draft(title, skill, TradeVisibility::Public))
            .await
            .unwrap();
    }

    let page = harness
        .trades
        .search_trades(
            None,
            TradeSearch {
                search_term: Some("  PIANO ".into()),
                ..TradeSearch::default()
            },
        )
        .await
        .unwrap();
    let mut titles: Vec<String> = page.items.into_iter().map(|trade| trade.title).collect();
    titles.sort();
    assert_eq!(titles, vec!["Evening sessions", "Piano lessons"]);
    assert!(!page.has_more);
}

#[tokio::test]
async fn cursor_pages_through_every_trade_once() {
    let harness = harness();
    for index in 0..5 {
        harness
            .trades
            .create_trade(
                "u1",
                draft(&format!("Lesson {index}"), "Guitar", TradeVisibility::Public),
            )
            .await
            .unwrap();
    }

    let mut seen = Vec::new();
    let mut cursor = None;
    loop {
        let page = harness
            .trades
            .search_trades(
                None,
                TradeSearch {
                    limit: Some(2),
                    cursor: cursor.clone(),
                    ..TradeSearch::default()
                },
            )
            .await
            .unwrap();
        seen.extend(page.items.into_iter().map(|trade| trade.id));
        if !page.has_more {
            break;
        }
        cursor = page.next_cursor;
        assert!(cursor.is_some());
    }
    let total = seen.len();
    seen.sort();
    seen.dedup();
    assert_eq!(total, 5);
    assert_eq!(seen.len(), 5);
}

#[tokio::test]
async fn batch_cap_reports_more_results() {
    let harness = harness_with(ServiceConfig {
        search_max_batches: 2,
        ..ServiceConfig::default()
    });
    for index in 0..6 {
        harness
            .trades
            .create_trade(
                "u1",
                draft(&format!("Lesson {index}"), "Drums", TradeVisibility::Public),
            )
            .await
            .unwrap();
    }
    harness
        .trades
        .create_trade("u1", draft("Guitar basics", "Guitar", TradeVisibility::Public))
        .await
        .unwrap();

    let search = |cursor: Option<String>| TradeSearch {
        search_term: Some("guitar".into()),
        limit: Some(2),
        cursor,
        ..TradeSearch::default()
    };

    let first = harness.trades.search_trades(None, search(None)).await.unwrap();
    assert_eq!(first.batches_fetched, 2);
    assert!(first.items.len() < 2);
    assert!(first.has_more);
    let cursor = first.next_cursor.clone();
    assert!(cursor.is_some());

    let second = harness.trades.search_trades(None, search(cursor)).await.unwrap();
    assert!(!second.has_more);
    assert!(second.next_cursor.is_none());
    assert_eq!(first.items.len() + second.items.len(), 1);
}

#[tokio::test]
async fn overdue_requests_complete_automatically() {
    let harness = harness_with(ServiceConfig::default().with_auto_complete_days(1));
    let id = in_progress(&harness).await;
    let untouched = in_progress(&harness).await;
    harness
        .trades
        .request_trade_completion("u1", &id, CompletionRequestInput::default())
        .await
        .unwrap();

    assert!(harness.trades.auto_complete_overdue(0).await.unwrap().is_empty());

    let completed = harness.trades.auto_complete_overdue(i64::MAX).await.unwrap();
    assert_eq!(completed, vec![id.clone()]);
    let trade = harness.trades.get_trade(&id).await.unwrap();
    assert_eq!(trade.status, TradeStatus::Completed);
    assert!(trade.auto_completed);
    assert!(trade.completion_confirmed_by.is_none());
    assert_eq!(
        harness.trades.get_trade(&untouched).await.unwrap().status,
        TradeStatus::InProgress
    );
    for user in ["u1", "u2"] {
        assert_eq!(harness.users.get_social_stats(user).await.unwrap().trade_count, 1);
    }

    assert!(harness.trades.auto_complete_overdue(i64::MAX).await.unwrap().is_empty());
}

#[tokio::test]
async fn user_trades_cover_created_and_joined() {
    let harness = harness();
    let joined = in_progress(&harness).await;
    let own = harness
        .trades
        .create_trade("u2", draft("Baking for piano", "Baking", TradeVisibility::Private))
        .await
        .unwrap();
    harness
        .trades
        .create_trade("u3", draft("Unrelated", "Chess", TradeVisibility::Public))
        .await
        .unwrap();

    let mut ids: Vec<String> = harness
        .trades
        .list_user_trades("u2")
        .await
        .unwrap()
        .into_iter()
        .map(|trade| trade.id)
        .collect();
    ids.sort();
    let mut expected = vec![joined, own.id];
    expected.sort();
    assert_eq!(ids, expected);
    assert!(harness.trades.list_user_trades("u4").await.unwrap().is_empty());
}

#[tokio::test]
async fn dispute_resume_and_cancel() {
    let harness = harness();
    let id = in_progress(&harness).await;
    harness
        .trades
        .request_trade_completion("u1", &id, CompletionRequestInput::default())
        .await
        .unwrap();

    let disputed = harness
        .trades
        .request_trade_changes("u2", &id, "The logo needs another pass")
        .await
        .unwrap();
    assert_eq!(disputed.status, TradeStatus::Disputed);
    assert!(disputed.completion.is_none());
    assert_eq!(disputed.change_requests.len(), 1);
    assert!(!disputed.change_requests[0].resolved);

    let resumed = harness.trades.resume_trade("u1", &id).await.unwrap();
    assert_eq!(resumed.status, TradeStatus::InProgress);
    assert!(resumed.change_requests.iter().all(|request| request.resolved));

    let cancelled = harness.trades.cancel_trade("u2", &id).await.unwrap();
    assert_eq!(cancelled.status, TradeStatus::Cancelled);
}

#[tokio::test]
async fn illegal_transitions_are_rejected() {
    let harness = harness();
    let open = harness
        .trades
        .create_trade("u1", draft("Guitar for cooking", "Guitar", TradeVisibility::Public))
        .await
        .unwrap();
    let err = harness
        .trades
        .request_trade_changes("u1", &open.id, "Not started yet")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid-status");

    let id = in_progress(&harness).await;
    let err = harness.trades.resume_trade("u1", &id).await.unwrap_err();
    assert_eq!(err.code(), "invalid-status");

    let err = harness.trades.cancel_trade("u9", &id).await.unwrap_err();
    assert_eq!(err.code(), "permission-denied");

    harness.trades.cancel_trade("u1", &id).await.unwrap();
    let err = harness.trades.cancel_trade("u1", &id).await.unwrap_err();
    assert_eq!(err.code(), "invalid-status");
    let err = harness
        .trades
        .request_trade_completion("u1", &id, CompletionRequestInput::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid-status");
}
