//! Integration tests for the resumable watch: reconnects, bookmark
//! expiry and error classes.

mod common;

use chrono::Utc;
use common::{at_bookmark, warning, FakeSource, Session};
use event_healer::watch::{BackoffConfig, WatchSettings};
use event_healer::{Error, RawEvent, SourceError, WatchEventKind, WatchItem, WatchManager};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn settings() -> WatchSettings {
    WatchSettings {
        timeout: Duration::from_secs(60),
        idle_grace: Duration::from_secs(5),
        backoff: BackoffConfig {
            base: Duration::from_millis(1),
            cap: Duration::from_millis(5),
            jitter: 0.0,
        },
    }
}

fn manager(source: &Arc<FakeSource>, start: Option<&str>) -> WatchManager {
    WatchManager::new(
        source.clone(),
        "default",
        start.map(str::to_string),
        settings(),
        CancellationToken::new(),
    )
}

async fn next_item(watch: &mut WatchManager) -> WatchItem {
    tokio::time::timeout(Duration::from_secs(5), watch.next())
        .await
        .expect("watch stalled")
        .expect("watch failed")
        .expect("watch cancelled")
}

fn event(item: WatchItem) -> RawEvent {
    match item {
        WatchItem::Event(event) => event,
        WatchItem::Resync { bookmark } => panic!("unexpected resync at {bookmark}"),
    }
}

#[tokio::test]
async fn test_reconnect_resumes_from_last_delivered_bookmark() {
    let now = Utc::now();
    let e1 = at_bookmark(warning("ev-1", "BackOff", 1, now), "10");
    let e2 = at_bookmark(warning("ev-2", "BackOff", 1, now), "11");
    let e3 = at_bookmark(warning("ev-3", "BackOff", 1, now), "12");

    let source = Arc::new(FakeSource::new(vec![
        Session::Stream(vec![Ok(e1.clone()), Ok(e2.clone())]),
        // Server redelivers the last event after the reconnect
        Session::Stream(vec![Ok(e2.clone()), Ok(e3.clone())]),
    ]));
    let mut watch = manager(&source, Some("5"));

    let delivered: Vec<RawEvent> = [
        next_item(&mut watch).await,
        next_item(&mut watch).await,
        next_item(&mut watch).await,
        next_item(&mut watch).await,
    ]
    .into_iter()
    .map(event)
    .collect();

    assert_eq!(delivered, vec![e1, e2.clone(), e2, e3]);
    assert_eq!(source.subscriptions(), vec!["5", "11"]);
    assert_eq!(watch.cursor().bookmark(), Some("12"));
    assert_eq!(source.baseline_calls(), 0);
}

#[tokio::test]
async fn test_bookmarks_advance_cursor_without_being_forwarded() {
    let now = Utc::now();
    let after = at_bookmark(warning("ev-1", "BackOff", 1, now), "21");
    let source = Arc::new(FakeSource::new(vec![
        Session::Stream(vec![Ok(RawEvent::bookmark("20"))]),
        Session::Stream(vec![Ok(after.clone())]),
    ]));
    let mut watch = manager(&source, Some("5"));

    assert_eq!(event(next_item(&mut watch).await), after);
    assert_eq!(source.subscriptions(), vec!["5", "20"]);
}

#[tokio::test]
async fn test_expired_bookmark_resyncs_from_fresh_baseline() {
    let now = Utc::now();
    let after = at_bookmark(warning("ev-1", "BackOff", 1, now), "101");
    let source = Arc::new(
        FakeSource::new(vec![
            Session::Stream(vec![Err(SourceError::Expired("too old resource version".to_string()))]),
            Session::Stream(vec![Ok(after.clone())]),
        ])
        .with_baselines(vec![Ok("100".to_string())]),
    );
    let mut watch = manager(&source, Some("5"));

    assert_eq!(
        next_item(&mut watch).await,
        WatchItem::Resync {
            bookmark: "100".to_string()
        }
    );
    assert_eq!(event(next_item(&mut watch).await), after);
    assert_eq!(source.subscriptions(), vec!["5", "100"]);
}

#[tokio::test]
async fn test_expired_start_bookmark_is_rejected_at_subscribe() {
    let now = Utc::now();
    let after = at_bookmark(warning("ev-1", "BackOff", 1, now), "101");
    let source = Arc::new(
        FakeSource::new(vec![
            Session::Refuse(SourceError::Expired("too old resource version".to_string())),
            Session::Stream(vec![Ok(after.clone())]),
        ])
        .with_baselines(vec![Ok("100".to_string())]),
    );
    let mut watch = manager(&source, Some("1"));

    assert!(matches!(next_item(&mut watch).await, WatchItem::Resync { .. }));
    assert_eq!(event(next_item(&mut watch).await), after);
    assert_eq!(source.subscriptions(), vec!["1", "100"]);
}

#[tokio::test]
async fn test_fresh_start_uses_baseline_without_resync_marker() {
    let now = Utc::now();
    let first = at_bookmark(warning("ev-1", "BackOff", 1, now), "51");
    let source = Arc::new(
        FakeSource::new(vec![Session::Stream(vec![Ok(first.clone())])])
            .with_baselines(vec![Ok("50".to_string())]),
    );
    let mut watch = manager(&source, None);

    assert_eq!(event(next_item(&mut watch).await), first);
    assert_eq!(source.subscriptions(), vec!["50"]);
    assert!(watch.cursor().last_connected().is_some());
}

#[tokio::test]
async fn test_transport_errors_reconnect_with_backoff() {
    let now = Utc::now();
    let first = at_bookmark(warning("ev-1", "BackOff", 1, now), "7");
    let source = Arc::new(FakeSource::new(vec![
        Session::Refuse(SourceError::Transport("connection refused".to_string())),
        Session::Stream(vec![Err(SourceError::Transport("connection reset".to_string()))]),
        Session::Stream(vec![]),
        Session::Stream(vec![Ok(first.clone())]),
    ]));
    let mut watch = manager(&source, Some("5"));

    assert_eq!(event(next_item(&mut watch).await), first);
    assert_eq!(source.subscriptions(), vec!["5", "5", "5", "5"]);
}

#[tokio::test]
async fn test_malformed_payload_is_forwarded() {
    let now = Utc::now();
    let after = at_bookmark(warning("ev-1", "BackOff", 1, now), "6");
    let source = Arc::new(FakeSource::new(vec![Session::Stream(vec![
        Err(SourceError::Malformed("missing field `involvedObject`".to_string())),
        Ok(after.clone()),
    ])]));
    let mut watch = manager(&source, Some("5"));

    let malformed = event(next_item(&mut watch).await);
    assert_eq!(malformed.kind, WatchEventKind::Error);
    assert!(malformed.involved.is_none());
    assert_eq!(event(next_item(&mut watch).await), after);
}

#[tokio::test]
async fn test_fatal_error_ends_the_stream() {
    let source = Arc::new(FakeSource::new(vec![Session::Stream(vec![Err(
        SourceError::from_status(403, "events is forbidden"),
    )])]));
    let mut watch = manager(&source, Some("5"));

    let result = tokio::time::timeout(Duration::from_secs(5), watch.next())
        .await
        .unwrap();
    assert!(matches!(result, Err(Error::Watch(SourceError::Fatal(_)))));
}

#[tokio::test]
async fn test_fatal_subscribe_error_ends_the_stream() {
    let source = Arc::new(FakeSource::new(vec![Session::Refuse(
        SourceError::from_status(401, "Unauthorized"),
    )]));
    let mut watch = manager(&source, Some("5"));

    let result = tokio::time::timeout(Duration::from_secs(5), watch.next())
        .await
        .unwrap();
    assert!(matches!(result, Err(Error::Watch(SourceError::Fatal(_)))));
}

#[tokio::test]
async fn test_cancellation_unblocks_pending_receive() {
    let source = Arc::new(FakeSource::new(Vec::new()));
    let cancel = CancellationToken::new();
    let mut watch = WatchManager::new(
        source.clone(),
        "default",
        Some("5".to_string()),
        settings(),
        cancel.clone(),
    );

    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });

    let result = tokio::time::timeout(Duration::from_secs(5), watch.next())
        .await
        .unwrap();
    assert!(matches!(result, Ok(None)));
}

#[tokio::test]
async fn test_idle_guard_survives_dropped_receives() {
    let source = Arc::new(FakeSource::new(Vec::new()));
    let mut watch = WatchManager::new(
        source.clone(),
        "default",
        Some("5".to_string()),
        WatchSettings {
            timeout: Duration::from_millis(100),
            idle_grace: Duration::from_millis(50),
            ..settings()
        },
        CancellationToken::new(),
    );

    // Each receive is abandoned well before the guard would expire on its own
    let until = tokio::time::Instant::now() + Duration::from_millis(600);
    while tokio::time::Instant::now() < until {
        let pending = tokio::time::timeout(Duration::from_millis(40), watch.next()).await;
        assert!(pending.is_err(), "silent watch returned {pending:?}");
    }

    assert!(source.subscriptions().len() >= 2);
}
