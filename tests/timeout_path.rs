mod common;

use std::{net::SocketAddr, time::Duration};

use cluster_messaging::{message::MessageOut, test_utils::TestNode, verb::Verb};
use common::{Outcome, OneShotCallback};

#[tokio::test]
async fn failure_aware_callback_fires_on_expiry_and_increments_timeout_counters() {
    let node = TestNode::spawn().await;
    // Nothing is listening here, which stands in for "the peer's reader has stopped": no reply
    // will ever arrive, regardless of why.
    let unreachable: SocketAddr = "127.0.0.1:1".parse().unwrap();

    let (callback, rx) = OneShotCallback::<String>::new(true);
    let msg = MessageOut::new(Verb::Echo, &"ping".to_string()).unwrap();
    node.hub
        .send_rr::<String, _>(msg, unreachable, callback, Some(Duration::from_millis(100)))
        .await
        .unwrap();

    let outcome = tokio::time::timeout(Duration::from_millis(500), rx)
        .await
        .expect("on_failure should fire between 100ms and 500ms")
        .unwrap();

    match outcome {
        Outcome::Failure(target) => assert_eq!(target, unreachable),
        Outcome::Response(..) => panic!("expected a failure notification, not a response"),
    }

    assert_eq!(node.hub.stats().total_timeouts(), 1);
    let per_host = node.hub.stats().timeouts_per_host().await;
    assert_eq!(*per_host.get(&unreachable).unwrap(), 1);
}

#[tokio::test]
async fn non_failure_aware_callback_is_dropped_silently_on_expiry() {
    let node = TestNode::spawn().await;
    let unreachable: SocketAddr = "127.0.0.1:1".parse().unwrap();

    let (callback, mut rx) = OneShotCallback::<String>::new(false);
    let msg = MessageOut::new(Verb::Echo, &"ping".to_string()).unwrap();
    node.hub
        .send_rr::<String, _>(msg, unreachable, callback, Some(Duration::from_millis(50)))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    // No failure notification was ever queued; the sender is simply never told.
    assert!(rx.try_recv().is_err());
    assert_eq!(node.hub.stats().total_timeouts(), 1);
}
