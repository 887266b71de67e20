mod common;

use std::time::Duration;

use cluster_messaging::{message::MessageOut, test_utils::TestNode, verb::Verb};
use common::{Outcome, OneShotCallback};

#[tokio::test]
async fn echo_probe_round_trips_within_a_second() {
    let node = TestNode::spawn().await;
    let before = node.hub.stats().pending_callbacks().await;

    let (callback, rx) = OneShotCallback::<String>::new(false);
    let msg = MessageOut::new(Verb::Echo, &"ping".to_string()).unwrap();
    node.hub.send_rr::<String, _>(msg, node.addr(), callback, None).await.unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(1), rx).await.expect("echo should reply within 1s").unwrap();
    match outcome {
        Outcome::Response(from, payload) => {
            assert_eq!(from, node.addr());
            assert_eq!(payload, "ping");
        },
        Outcome::Failure(_) => panic!("expected a response, not a failure"),
    }

    // The registry should have returned to its prior size: the reply removed the callback.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(node.hub.stats().pending_callbacks().await, before);
}
