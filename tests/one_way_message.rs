//! A message sent from one peer's destination arrives at the other peer's
//! registered message handler over a real loopback connection.

use std::sync::Arc;
use std::time::Duration;

use peerlink::{Peer, PeerConfig};
use tokio::sync::oneshot;

fn config(name: &str) -> PeerConfig {
    peerlink::load_config_from_str(&format!(r#"name = "{name}""#)).unwrap()
}

#[tokio::test]
async fn message_reaches_the_registered_handler() {
    let receiver = Peer::new(&config("receiver"));
    let addr = receiver.listen("127.0.0.1:0").await.unwrap();

    let (tx, rx) = oneshot::channel();
    let tx = std::sync::Mutex::new(Some(tx));
    let role = receiver.role("echo");
    role.on_message(
        "ping",
        Arc::new(move |ctx| {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(ctx.data.clone());
            }
            Box::pin(async {})
        }),
    );

    let sender = Peer::new(&config("sender"));
    let unit = sender.connect(&format!("ws://{addr}"), Default::default()).await.unwrap();
    unit.send("echo", "ping", peerlink::Value::Bool(true)).await.unwrap();

    let data = tokio::time::timeout(Duration::from_secs(1), rx).await.unwrap().unwrap();
    assert_eq!(data, peerlink::Value::Bool(true));
}
