//! A request whose handler replies slower than the caller's timeout
//! surfaces a timeout error to the caller rather than hanging or resolving
//! late.

use std::sync::Arc;
use std::time::Duration;

use peerlink::{Peer, PeerConfig, SendError, Value};

fn config(name: &str) -> PeerConfig {
    peerlink::load_config_from_str(&format!(r#"name = "{name}""#)).unwrap()
}

#[tokio::test]
async fn slow_handler_trips_the_caller_side_timeout() {
    let responder = Peer::new(&config("responder"));
    let addr = responder.listen("127.0.0.1:0").await.unwrap();

    let role = responder.role("echo");
    role.on_request(
        "slow",
        Arc::new(move |ctx| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                ctx.reply(None).await;
            })
        }),
    );

    let caller = Peer::new(&config("caller"));
    let unit = caller.connect(&format!("ws://{addr}"), Default::default()).await.unwrap();
    let result = unit
        .request("echo", "slow", Value::Bool(true), Some(Duration::from_nanos(1)), false)
        .await;
    assert!(matches!(result, Err(SendError::Timeout(_))));
}
