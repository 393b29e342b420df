//! A writer streams 1 MiB of random bytes in 1 KiB chunks to a peer that
//! reads them back; the SHA-256 digests on both ends must match and the
//! reader must observe a clean EOF once the writer closes.

use std::sync::Arc;

use peerlink::{Peer, PeerConfig, StreamError, Value};
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::sync::oneshot;

fn config(name: &str) -> PeerConfig {
    peerlink::load_config_from_str(&format!(r#"name = "{name}""#)).unwrap()
}

#[tokio::test]
async fn digests_match_and_reader_sees_eof() {
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
                let mut hasher = Sha256::new();
                loop {
                    match reader.read_chunk().await {
                        Ok(chunk) => hasher.update(&chunk),
                        Err(StreamError::Eof) => break,
                        Err(_) => return,
                    }
                }
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send(hasher.finalize().to_vec());
                }
            })
        }),
    );

    let caller = Peer::new(&config("caller"));
    let unit = caller.connect(&format!("ws://{addr}"), Default::default()).await.unwrap();
    let (_outcome, writer) = unit.new_writer("xfer", "upload", Value::Null, None).await.unwrap();
    let writer = writer.expect("responder replied with a stream");

    let mut local_hasher = Sha256::new();
    let mut rng = rand::thread_rng();
    for _ in 0..1024 {
        let mut chunk = [0u8; 1024];
        rng.fill_bytes(&mut chunk);
        local_hasher.update(&chunk);
        writer.write_chunk(&chunk).await.unwrap();
    }
    writer.close().await.unwrap();

    let remote_digest = tokio::time::timeout(std::time::Duration::from_secs(5), rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(remote_digest, local_hasher.finalize().to_vec());
}
