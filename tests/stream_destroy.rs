//! Calling `destroy` on one end of an open stream surfaces an error
//! containing the given reason on the other end's next read/write.

use std::sync::Arc;

use peerlink::{Peer, PeerConfig, StreamError, Value};
use tokio::sync::oneshot;

fn config(name: &str) -> PeerConfig {
    peerlink::load_config_from_str(&format!(r#"name = "{name}""#)).unwrap()
}

#[tokio::test]
async fn destroy_surfaces_the_reason_on_the_other_end() {
    let responder = Peer::new(&config("responder"));
    let addr = responder.listen("127.0.0.1:0").await.unwrap();

    let (tx, rx) = oneshot::channel();
    let tx = std::sync::Mutex::new(Some(tx));

    let role = responder.role("xfer");
    role.on_reader_request(
        "upload",
        Arc::new(move |ctx| {
            Box::pin(async move {
                let Some(reader) = ctx.reply(None).await else { return };
                let err = loop {
                    match reader.read_chunk().await {
                        Ok(_) => continue,
                        Err(e) => break e,
                    }
                };
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send(err);
                }
            })
        }),
    );

    let caller = Peer::new(&config("caller"));
    let unit = caller.connect(&format!("ws://{addr}"), Default::default()).await.unwrap();
    let (_outcome, writer) = unit.new_writer("xfer", "upload", Value::Null, None).await.unwrap();
    let writer = writer.expect("responder replied with a stream");

    writer.destroy("some error").await;

    let err = tokio::time::timeout(std::time::Duration::from_secs(5), rx)
        .await
        .unwrap()
        .unwrap();
    match err {
        StreamError::RemoteError(msg) => assert!(msg.contains("some error")),
        other => panic!("expected a remote error, got {other:?}"),
    }
}
