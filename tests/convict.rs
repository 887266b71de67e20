mod common;

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use cluster_messaging::{message::MessageOut, test_utils::TestNode, verb::Verb};
use tokio::{io::AsyncReadExt, net::TcpListener};

#[tokio::test]
async fn convict_discards_the_pending_message_and_a_fresh_send_succeeds() {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let accepted2 = accepted.clone();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            accepted2.fetch_add(1, Ordering::SeqCst);
            let mut buf = [0u8; 1024];
            loop {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {},
                }
            }
        }
    });

    let node = TestNode::spawn().await;

    // No `.await` between these two calls ever yields back to the scheduler on an uncontended
    // lock, so the freshly spawned writer task has no chance to run before `convict` bumps the
    // connection's generation: this message is guaranteed to be discarded.
    let msg1 = MessageOut::new(Verb::Mutation, &"first".to_string()).unwrap();
    node.hub.send_one_way_with_id(msg1, 1, addr).await;
    node.hub.convict(addr).await;

    let msg2 = MessageOut::new(Verb::Mutation, &"second".to_string()).unwrap();
    node.hub.send_one_way_with_id(msg2, 2, addr).await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(node.hub.stats().completed_messages(addr).await, 1);
}
