//! A request that passes through a catch-all handler and an event-specific
//! handler, each registering a `then` callback, resolves with the handlers'
//! writes and `then` callbacks interleaved in catch-all-first,
//! last-registered-then-first order.

use std::sync::{Arc, Mutex};

use peerlink::{Peer, PeerConfig, ResponseOutcome, Value};

fn config(name: &str) -> PeerConfig {
    peerlink::load_config_from_str(&format!(r#"name = "{name}""#)).unwrap()
}

#[tokio::test]
async fn catch_all_and_specific_handlers_interleave_with_their_then_callbacks() {
    let responder = Peer::new(&config("responder"));
    let addr = responder.listen("127.0.0.1:0").await.unwrap();

    let trace = Arc::new(Mutex::new(String::new()));

    let role = responder.role("echo");
    let t1 = trace.clone();
    role.on_request(
        "",
        Arc::new(move |ctx| {
            let t1 = t1.clone();
            Box::pin(async move {
                t1.lock().unwrap().push('1');
                let t1b = t1.clone();
                ctx.then(move || t1b.lock().unwrap().push('1'));
            })
        }),
    );
    let t2 = trace.clone();
    role.on_request(
        "test",
        Arc::new(move |ctx| {
            let t2 = t2.clone();
            Box::pin(async move {
                t2.lock().unwrap().push('2');
                let t2b = t2.clone();
                ctx.then(move || t2b.lock().unwrap().push('2'));
                ctx.reply(None).await;
            })
        }),
    );

    let caller = Peer::new(&config("caller"));
    let unit = caller.connect(&format!("ws://{addr}"), Default::default()).await.unwrap();
    let outcome = unit
        .request("echo", "test", Value::Bool(true), None, false)
        .await
        .unwrap();
    assert!(matches!(outcome, ResponseOutcome::Resolved(_)));
    assert_eq!(*trace.lock().unwrap(), "1221");
}
