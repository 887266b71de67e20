mod common;

use std::time::Duration;

use cluster_messaging::test_utils::TestNode;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

#[tokio::test]
async fn bad_magic_closes_the_connection_before_any_frame_is_read() {
    let node = TestNode::spawn().await;
    let before = node.hub.stats().pending_callbacks().await;

    let mut socket = TcpStream::connect(node.addr()).await.unwrap();
    socket.write_all(&0xDEAD_BEEFu32.to_be_bytes()).await.unwrap();
    socket.flush().await.unwrap();

    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(1), socket.read(&mut buf))
        .await
        .expect("server should close promptly")
        .unwrap();
    assert_eq!(read, 0, "server should close the socket without writing anything back");

    assert_eq!(node.hub.stats().pending_callbacks().await, before);
}
