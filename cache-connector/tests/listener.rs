mod common;

use anyhow::Result;
use cache_connector::error::{ConnectorError, SubscriptionError};
use cache_connector::events::{ChannelKind, ConfirmedTransfer, SubscriptionKey, TransactionIdentity};
use cache_connector::transport::SessionState;
use cache_connector::{ListenerError, ListenerHandle, ListenerManager, ObserverError};
use common::{address, eventually, settle, test_config, transfer_body, MockNode, ALICE, BOB};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn start(node: &MockNode, domains: &[&str]) -> ListenerHandle {
    let (manager, handle) = ListenerManager::new(Arc::new(test_config(domains)), node.transport());
    tokio::spawn(manager.run());
    handle
}

fn recorder(log: &Arc<Mutex<Vec<String>>>) -> impl Fn(&ConfirmedTransfer) -> Result<(), ObserverError> + Send + Sync + 'static {
    let log = log.clone();
    move |transfer: &ConfirmedTransfer| -> Result<(), ObserverError> {
        log.lock().push(transfer.identity.to_string());
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn unconfirmed_then_confirmed_yields_one_merged_event() -> Result<()> {
    let node = MockNode::new();
    let handle = start(&node, &["node-a"]);
    let mut listener = handle.listen(address(ALICE)).await?;

    node.push(ALICE, ChannelKind::Unconfirmed, &transfer_body(Some("tx1"), ALICE, 2, None));
    node.push(ALICE, ChannelKind::Confirmed, &transfer_body(Some("tx1"), ALICE, 2, Some(1_500)));

    let event = listener.next_transfer().await.expect("listener closed");
    assert_eq!(event.identity, TransactionIdentity::Hash("tx1".to_string()));
    assert_eq!(event.payload.amount, Some(2));
    assert_eq!(event.payload.height, Some(1_500));
    assert_eq!(event.payload.message.as_ref().map(|m| m.payload()), Some("hello"));

    settle().await;
    assert!(listener.try_next_transfer().is_none());
    assert_eq!(handle.stats().emitted, 1);
    assert_eq!(handle.stats().pending, 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn duplicate_confirmation_yields_one_event() -> Result<()> {
    let node = MockNode::new();
    let handle = start(&node, &["node-a"]);
    let mut listener = handle.listen(address(ALICE)).await?;

    let body = transfer_body(Some("tx2"), ALICE, 7, Some(10));
    node.push(ALICE, ChannelKind::Confirmed, &body);
    node.push(ALICE, ChannelKind::Confirmed, &body);

    let event = listener.next_transfer().await.expect("listener closed");
    assert_eq!(event.hash.as_deref(), Some("tx2"));
    settle().await;
    assert!(listener.try_next_transfer().is_none());
    assert_eq!(handle.stats().duplicates_suppressed, 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn cancelled_observer_receives_nothing_further() -> Result<()> {
    let node = MockNode::new();
    let handle = start(&node, &["node-a"]);
    let first = Arc::new(Mutex::new(Vec::new()));
    let second = Arc::new(Mutex::new(Vec::new()));

    let first_token = handle.add_observer(address(ALICE), recorder(&first)).await?;
    handle.add_observer(address(ALICE), recorder(&second)).await?;

    node.push(ALICE, ChannelKind::Confirmed, &transfer_body(Some("a"), ALICE, 1, Some(1)));
    eventually("both observers notified", || second.lock().len() == 1).await;
    assert_eq!(*first.lock(), vec!["a"]);

    assert!(handle.cancel(&first_token).await);
    assert!(!handle.cancel(&first_token).await);

    node.push(ALICE, ChannelKind::Confirmed, &transfer_body(Some("b"), ALICE, 1, Some(2)));
    eventually("second observer notified", || second.lock().len() == 2).await;
    assert_eq!(*first.lock(), vec!["a"]);
    assert_eq!(handle.observer_count(&address(ALICE)), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn failing_observer_is_isolated_and_reported() -> Result<()> {
    let node = MockNode::new();
    let handle = start(&node, &["node-a"]);
    let mut errors = handle.errors();

    handle
        .add_observer(address(ALICE), |_: &ConfirmedTransfer| -> Result<(), ObserverError> {
            Err(ObserverError::Failed("database unavailable".to_string()))
        })
        .await?;
    let mut listener = handle.listen(address(ALICE)).await?;

    node.push(ALICE, ChannelKind::Confirmed, &transfer_body(Some("tx9"), ALICE, 3, Some(4)));

    assert!(listener.next_transfer().await.is_some());
    match errors.recv().await? {
        ListenerError::Observer { identity, error, .. } => {
            assert_eq!(identity, TransactionIdentity::Hash("tx9".to_string()));
            assert_eq!(error, ObserverError::Failed("database unavailable".to_string()));
        }
        other => panic!("unexpected error {:?}", other),
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_waits_out_a_busy_observer_without_stalling_the_runtime() -> Result<()> {
    let node = MockNode::new();
    let handle = start(&node, &["node-a"]);
    let (entered_tx, entered_rx) = std::sync::mpsc::channel::<()>();
    let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
    let entered_tx = Mutex::new(entered_tx);
    let release_rx = Mutex::new(release_rx);
    let calls = Arc::new(AtomicUsize::new(0));
    let counted = calls.clone();

    let token = handle
        .add_observer(address(ALICE), move |_: &ConfirmedTransfer| -> Result<(), ObserverError> {
            counted.fetch_add(1, Ordering::SeqCst);
            let _ = entered_tx.lock().send(());
            let _ = release_rx.lock().recv();
            Ok(())
        })
        .await?;

    node.push(ALICE, ChannelKind::Confirmed, &transfer_body(Some("tx10"), ALICE, 1, Some(1)));
    tokio::task::spawn_blocking(move || entered_rx.recv()).await??;

    let cancelling = {
        let handle = handle.clone();
        let token = token.clone();
        tokio::spawn(async move { handle.cancel(&token).await })
    };
    // One worker runs the blocked delivery; the other must stay free.
    let answer = tokio::time::timeout(Duration::from_secs(1), tokio::spawn(async { 42 })).await??;
    assert_eq!(answer, 42);
    assert!(!cancelling.is_finished());

    release_tx.send(())?;
    drop(release_tx);
    assert!(cancelling.await?);

    node.push(ALICE, ChannelKind::Confirmed, &transfer_body(Some("tx11"), ALICE, 1, Some(2)));
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn observers_share_one_subscription_per_channel() -> Result<()> {
    let node = MockNode::new();
    let handle = start(&node, &["node-a"]);

    let (first, second) = tokio::join!(handle.listen(address(ALICE)), handle.listen(address(ALICE)));
    let (first, second) = (first?, second?);

    assert_eq!(node.subscribes().len(), 2);
    assert_eq!(node.connection_count(), 1);

    first.unsubscribe().await;
    assert!(node.unsubscribes().is_empty());
    assert_eq!(handle.active_subscriptions().len(), 2);

    second.unsubscribe().await;
    eventually("subscriptions released", || node.unsubscribes().len() == 2).await;
    let mut released = node.unsubscribes();
    released.sort();
    assert_eq!(
        released,
        vec![
            SubscriptionKey::new(address(ALICE), ChannelKind::Unconfirmed),
            SubscriptionKey::new(address(ALICE), ChannelKind::Confirmed),
        ]
    );
    eventually("session closed", || node.graceful_closes() == 1).await;
    assert_eq!(handle.session_state().await, None);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn dropping_a_listener_releases_its_subscriptions() -> Result<()> {
    let node = MockNode::new();
    let handle = start(&node, &["node-a"]);

    let listener = handle.listen(address(ALICE)).await?;
    drop(listener);

    eventually("subscriptions released", || node.unsubscribes().len() == 2).await;
    eventually("session closed", || node.graceful_closes() == 1).await;
    assert_eq!(handle.observer_count(&address(ALICE)), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn rejected_subscription_rolls_back() -> Result<()> {
    let node = MockNode::new();
    node.reject(SubscriptionKey::new(address(BOB), ChannelKind::Confirmed));
    let handle = start(&node, &["node-a"]);

    let err = handle.listen(address(BOB)).await.unwrap_err();
    assert!(matches!(
        err,
        ConnectorError::Subscription(SubscriptionError::Rejected { .. })
    ));
    assert!(handle.active_subscriptions().is_empty());
    eventually("unconfirmed released", || !node.unsubscribes().is_empty()).await;
    assert_eq!(
        node.unsubscribes(),
        vec![SubscriptionKey::new(address(BOB), ChannelKind::Unconfirmed)]
    );
    assert_eq!(handle.observer_count(&address(BOB)), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn unacknowledged_subscription_times_out() -> Result<()> {
    let node = MockNode::new();
    node.withhold_acks();
    let handle = start(&node, &["node-a"]);

    let err = handle.listen(address(ALICE)).await.unwrap_err();
    assert!(matches!(
        err,
        ConnectorError::Subscription(SubscriptionError::AckTimeout(_))
    ));
    assert!(handle.active_subscriptions().is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn endpoints_are_tried_in_order() -> Result<()> {
    let node = MockNode::new();
    node.set_unreachable("node-a");
    let handle = start(&node, &["node-a", "node-b", "node-c"]);

    let _listener = handle.listen(address(ALICE)).await?;
    assert_eq!(node.connect_attempts(), vec!["node-a", "node-b"]);
    assert_eq!(node.domain_of(0), "node-b");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn reconnect_reissues_subscriptions_and_tolerates_duplicate_acks() -> Result<()> {
    let node = MockNode::new();
    let handle = start(&node, &["node-a"]);
    let mut listener = handle.listen(address(ALICE)).await?;

    node.duplicate_acks();
    node.fail_next_connects(1);
    node.kill_connection();

    eventually("subscriptions re-issued", || node.subscribes_on(1).len() == 2).await;
    let mut state = None;
    for _ in 0..100 {
        state = handle.session_state().await;
        if state == Some(SessionState::Open) {
            break;
        }
        settle().await;
    }
    assert_eq!(state, Some(SessionState::Open));

    node.push(ALICE, ChannelKind::Unconfirmed, &transfer_body(Some("tx3"), ALICE, 4, None));
    node.push(ALICE, ChannelKind::Confirmed, &transfer_body(Some("tx3"), ALICE, 4, Some(9)));
    let event = listener.next_transfer().await.expect("listener closed");
    assert_eq!(event.payload.amount, Some(4));
    settle().await;
    assert!(listener.try_next_transfer().is_none());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn rejected_resubscription_is_reported_and_reclaimed() -> Result<()> {
    let node = MockNode::new();
    let handle = start(&node, &["node-a"]);
    let mut errors = handle.errors();
    let mut first = handle.listen(address(ALICE)).await?;
    let confirmed = SubscriptionKey::new(address(ALICE), ChannelKind::Confirmed);

    node.reject(confirmed.clone());
    node.kill_connection();

    match errors.recv().await? {
        ListenerError::Subscription(SubscriptionError::Rejected { key, .. }) => {
            assert_eq!(key, confirmed)
        }
        other => panic!("unexpected error {:?}", other),
    }
    eventually("rejected key dropped", || {
        handle.active_subscriptions() == vec![SubscriptionKey::new(address(ALICE), ChannelKind::Unconfirmed)]
    })
    .await;

    // The next subscriber on the address claims the dropped key again.
    node.allow(&confirmed);
    let mut second = handle.listen(address(ALICE)).await?;
    assert_eq!(handle.active_subscriptions().len(), 2);
    assert_eq!(
        node.subscribes_on(1).iter().filter(|key| **key == confirmed).count(),
        2
    );

    node.push(ALICE, ChannelKind::Confirmed, &transfer_body(Some("tx9"), ALICE, 6, Some(12)));
    assert_eq!(first.next_transfer().await.expect("listener closed").payload.amount, Some(6));
    assert_eq!(second.next_transfer().await.expect("listener closed").payload.amount, Some(6));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_report_session_lost_until_a_new_subscribe() -> Result<()> {
    let node = MockNode::new();
    let handle = start(&node, &["node-a"]);
    let mut errors = handle.errors();
    let mut alice = handle.listen(address(ALICE)).await?;

    node.fail_next_connects(u32::MAX);
    node.kill_connection();

    match errors.recv().await? {
        ListenerError::SessionLost { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(handle.session_state().await, Some(SessionState::Closed));

    // Recovery happens on the caller's next subscribe.
    node.fail_next_connects(0);
    let _bob = handle.listen(address(BOB)).await?;

    let mut reissued = node.subscribes_on(1);
    reissued.sort();
    assert_eq!(
        reissued,
        vec![
            SubscriptionKey::new(address(BOB), ChannelKind::Unconfirmed),
            SubscriptionKey::new(address(BOB), ChannelKind::Confirmed),
            SubscriptionKey::new(address(ALICE), ChannelKind::Unconfirmed),
            SubscriptionKey::new(address(ALICE), ChannelKind::Confirmed),
        ]
    );

    settle().await;
    node.push(ALICE, ChannelKind::Confirmed, &transfer_body(Some("tx4"), ALICE, 1, Some(3)));
    let event = alice.next_transfer().await.expect("listener closed");
    assert_eq!(event.hash.as_deref(), Some("tx4"));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn releases_proceed_while_a_new_session_connects() -> Result<()> {
    let node = MockNode::new();
    let handle = start(&node, &["node-a"]);
    let mut errors = handle.errors();
    let alice = handle.listen(address(ALICE)).await?;

    node.fail_next_connects(u32::MAX);
    node.kill_connection();
    assert!(matches!(errors.recv().await?, ListenerError::SessionLost { .. }));

    node.fail_next_connects(0);
    node.delay_connects(Duration::from_secs(5));
    let opening = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.listen(address(BOB)).await })
    };
    settle().await;

    tokio::time::timeout(Duration::from_secs(1), alice.unsubscribe()).await?;

    let _bob = opening.await??;
    let mut reissued = node.subscribes_on(1);
    reissued.sort();
    assert_eq!(
        reissued,
        vec![
            SubscriptionKey::new(address(BOB), ChannelKind::Unconfirmed),
            SubscriptionKey::new(address(BOB), ChannelKind::Confirmed),
        ]
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn stop_closes_the_session_and_refuses_new_observers() -> Result<()> {
    let node = MockNode::new();
    let handle = start(&node, &["node-a"]);
    let _listener = handle.listen(address(ALICE)).await?;

    handle.stop().await;
    eventually("session closed", || node.graceful_closes() == 1).await;
    assert!(matches!(
        handle.listen(address(BOB)).await,
        Err(ConnectorError::Shutdown)
    ));
    Ok(())
}

/// Watches a public testnet node. Set `CACHE_TESTNET_NODE` to `host[:port]` to override.
#[tokio::test]
#[ignore]
async fn live_testnet_session_opens() -> Result<()> {
    use cache_connector::config::Endpoint;

    let node = std::env::var("CACHE_TESTNET_NODE").unwrap_or_else(|_| "hugetestalice.nem.ninja".to_string());
    let mut config = test_config(&[]);
    config.node.endpoints = vec![Endpoint::parse(&node)];
    let (manager, handle) = ListenerManager::with_websocket(Arc::new(config));
    tokio::spawn(manager.run());

    let _listener = tokio::time::timeout(Duration::from_secs(30), handle.listen(address(ALICE))).await??;
    assert_eq!(handle.session_state().await, Some(SessionState::Open));
    handle.stop().await;
    Ok(())
}
