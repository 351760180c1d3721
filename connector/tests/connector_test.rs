mod common;

use common::{expect_disconnect, read_line, recv_json, recv_msg, start, start_with};
use ingot_connector::client;
use ingot_connector::control;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

#[tokio::test]
async fn forwards_client_messages_to_the_stratifier() {
    let mut h = start(false).await;

    let mut stream = TcpStream::connect(h.addr).await.unwrap();
    stream
        .write_all(b"{\"method\":\"mining.subscribe\"}\n")
        .await
        .unwrap();

    let msg = recv_json(&mut h.stratifier).await;
    assert_eq!(msg["method"], "mining.subscribe");
    assert_eq!(msg["client_id"], 1);
    assert_eq!(msg["address"], "127.0.0.1");
    assert_eq!(msg["server"], 0);
}

#[tokio::test]
async fn batched_lines_are_split_in_order() {
    let mut h = start(false).await;

    let mut stream = TcpStream::connect(h.addr).await.unwrap();
    stream
        .write_all(b"{\"seq\":1}\n{\"seq\":2}\n")
        .await
        .unwrap();

    assert_eq!(recv_json(&mut h.stratifier).await["seq"], 1);
    assert_eq!(recv_json(&mut h.stratifier).await["seq"], 2);
}

#[tokio::test]
async fn control_messages_reach_the_client_byte_for_byte() {
    let mut h = start(false).await;

    let mut stream = TcpStream::connect(h.addr).await.unwrap();
    stream
        .write_all(b"{\"method\":\"mining.subscribe\"}\n")
        .await
        .unwrap();
    let _ = recv_msg(&mut h.stratifier).await;

    control::handle_command(&h.connector, "{\"client_id\":1,\"result\":true}").await;

    let line = read_line(&mut stream).await;
    assert_eq!(
        serde_json::from_str::<Value>(&line).unwrap(),
        json!({"result": true})
    );
}

#[tokio::test]
async fn dropclient_closes_the_connection_once() {
    let mut h = start(false).await;

    let mut stream = TcpStream::connect(h.addr).await.unwrap();
    stream
        .write_all(b"{\"method\":\"mining.subscribe\"}\n")
        .await
        .unwrap();
    let _ = recv_msg(&mut h.stratifier).await;

    control::handle_command(&h.connector, "dropclient=1").await;
    assert_eq!(recv_msg(&mut h.stratifier).await, "dropclient=1");
    expect_disconnect(&mut stream).await;

    // The id is gone, so a second drop does nothing.
    control::handle_command(&h.connector, "dropclient=1").await;
    assert!(h.stratifier.try_recv().is_err());
}

#[tokio::test]
async fn composite_dropclient_is_ignored() {
    let mut h = start(false).await;

    let mut stream = TcpStream::connect(h.addr).await.unwrap();
    stream
        .write_all(b"{\"method\":\"mining.subscribe\"}\n")
        .await
        .unwrap();
    let _ = recv_msg(&mut h.stratifier).await;

    // Dropping a sub-client id must not touch the physical connection.
    let id = client::compose(1, 7);
    control::handle_command(&h.connector, &format!("dropclient={id}")).await;
    assert!(h.stratifier.try_recv().is_err());

    stream.write_all(b"{\"seq\":2}\n").await.unwrap();
    assert_eq!(recv_json(&mut h.stratifier).await["seq"], 2);
}

#[tokio::test]
async fn oversize_lines_disconnect_without_forwarding() {
    let mut h = start(false).await;

    let mut stream = TcpStream::connect(h.addr).await.unwrap();
    stream.write_all(&[b'x'; 1100]).await.unwrap();

    expect_disconnect(&mut stream).await;

    // Only the drop notice reaches the peer, never a client message.
    assert_eq!(recv_msg(&mut h.stratifier).await, "dropclient=1");
    assert!(h.stratifier.try_recv().is_err());
}

#[tokio::test]
async fn invalid_json_disconnects() {
    use tokio::io::AsyncReadExt;

    let mut h = start(false).await;

    let mut stream = TcpStream::connect(h.addr).await.unwrap();
    stream.write_all(b"not json at all\n").await.unwrap();

    assert_eq!(recv_msg(&mut h.stratifier).await, "dropclient=1");

    // The error reply is best effort: it only lands if the sender wins the
    // race with the disconnect. Whatever arrives must be exactly it.
    let mut buf = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut buf))
        .await
        .expect("timed out waiting for disconnect");
    if !buf.is_empty() {
        assert_eq!(buf, b"Invalid JSON, disconnecting\n".to_vec());
    }
}

#[tokio::test]
async fn passthrough_promotion_remaps_subclient_ids() {
    let mut h = start(true).await;

    let mut stream = TcpStream::connect(h.addr).await.unwrap();
    stream
        .write_all(b"{\"method\":\"mining.subscribe\"}\n")
        .await
        .unwrap();
    let first = recv_json(&mut h.generator).await;
    assert_eq!(first["client_id"], 1);

    control::handle_command(&h.connector, "passthrough=1").await;
    let line = read_line(&mut stream).await;
    assert_eq!(
        serde_json::from_str::<Value>(&line).unwrap(),
        json!({"result": true})
    );

    stream
        .write_all(b"{\"client_id\":7,\"method\":\"mining.notify\"}\n")
        .await
        .unwrap();

    let msg = recv_json(&mut h.generator).await;
    assert_eq!(msg["client_id"], client::compose(1, 7));
    assert_eq!(msg["server"], 0);
    assert!(msg.get("address").is_none());
    assert_eq!(msg["method"], "mining.notify");
}

#[tokio::test]
async fn replies_to_subclients_shed_the_composite_id() {
    let mut h = start(true).await;

    let mut stream = TcpStream::connect(h.addr).await.unwrap();
    stream
        .write_all(b"{\"method\":\"mining.subscribe\"}\n")
        .await
        .unwrap();
    let _ = recv_msg(&mut h.generator).await;
    control::handle_command(&h.connector, "passthrough=1").await;
    let _ = read_line(&mut stream).await;

    let id = client::compose(1, 7);
    control::handle_command(&h.connector, &format!("{{\"client_id\":{id},\"result\":\"ok\"}}"))
        .await;

    // The passthrough connection carries the reply with the sub-client id
    // its own downstream understands.
    let line = read_line(&mut stream).await;
    assert_eq!(
        serde_json::from_str::<Value>(&line).unwrap(),
        json!({"client_id": 7, "result": "ok"})
    );
}

#[tokio::test]
async fn stale_composite_sends_tell_the_stratifier_to_drop() {
    let mut h = start(false).await;

    let id = client::compose(5, 7);
    control::handle_command(&h.connector, &format!("{{\"client_id\":{id},\"x\":1}}")).await;

    assert_eq!(recv_msg(&mut h.stratifier).await, format!("dropclient={id}"));
}

#[tokio::test]
async fn composite_send_with_a_live_subclient_invalidates_it() {
    let mut h = start(false).await;

    let mut stream = TcpStream::connect(h.addr).await.unwrap();
    stream
        .write_all(b"{\"method\":\"mining.subscribe\"}\n")
        .await
        .unwrap();
    let _ = recv_msg(&mut h.stratifier).await;

    // Parent 9 does not exist, but the sub-client id names client 1.
    let id = client::compose(9, 1);
    control::handle_command(&h.connector, &format!("{{\"client_id\":{id},\"x\":1}}")).await;

    assert_eq!(recv_msg(&mut h.stratifier).await, "dropclient=1");
    expect_disconnect(&mut stream).await;
}

#[tokio::test]
async fn accept_gate_holds_connections_until_opened() {
    let mut h = start_with(false, false).await;

    let mut stream = TcpStream::connect(h.addr).await.unwrap();
    stream
        .write_all(b"{\"method\":\"mining.subscribe\"}\n")
        .await
        .unwrap();

    // Gated: the connection sits in the backlog unserviced.
    assert!(
        tokio::time::timeout(Duration::from_millis(200), h.stratifier.recv())
            .await
            .is_err()
    );

    h.connector.set_accepting(true);
    let msg = recv_json(&mut h.stratifier).await;
    assert_eq!(msg["method"], "mining.subscribe");
}

#[tokio::test]
async fn client_cap_defers_accepts_until_a_slot_frees() {
    let mut h = common::start_with_config(|config| {
        config.server.max_clients = 1;
    })
    .await;
    h.connector.set_accepting(true);

    let mut first = TcpStream::connect(h.addr).await.unwrap();
    first
        .write_all(b"{\"method\":\"mining.subscribe\"}\n")
        .await
        .unwrap();
    let _ = recv_msg(&mut h.stratifier).await;

    let mut second = TcpStream::connect(h.addr).await.unwrap();
    second.write_all(b"{\"seq\":2}\n").await.unwrap();
    assert!(
        tokio::time::timeout(Duration::from_millis(200), h.stratifier.recv())
            .await
            .is_err()
    );

    // Free the slot; the backlogged connection gets serviced. The drop
    // notice and the second client's message race on different tasks.
    drop(first);
    let notices = [
        recv_msg(&mut h.stratifier).await,
        recv_msg(&mut h.stratifier).await,
    ];
    assert!(notices.contains(&"dropclient=1".to_string()));
    assert!(notices.iter().any(|n| n.contains("\"seq\":2")));
}
