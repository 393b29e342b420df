//! Losing a connection that was opened via `connect` triggers an automatic
//! reconnect and the destination becomes ready again, while a connection
//! torn down by `close_unit` on the dialing side stays down.

use std::time::Duration;

use peerlink::{Peer, PeerConfig};

fn config(name: &str) -> PeerConfig {
    peerlink::load_config_from_str(&format!(r#"name = "{name}""#)).unwrap()
}

async fn wait_until(mut check: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}

#[tokio::test(flavor = "multi_thread")]
async fn forced_disconnect_reconnects_within_two_intervals() {
    let responder = Peer::new(&config("responder"));
    responder.role("worker");
    let addr = responder.listen("127.0.0.1:0").await.unwrap();

    let client = Peer::new(&config("client"));
    client.connect(&format!("ws://{addr}"), Default::default()).await.unwrap();
    let dest = client.destination("worker");
    assert!(dest.is_ready());

    let remote_unit_id = responder.units()[0].id.clone();
    responder.close_unit(&remote_unit_id).await;

    assert!(
        wait_until(|| !dest.is_ready(), Duration::from_secs(2)).await,
        "destination should drop once the transport is forcibly closed"
    );
    assert!(
        wait_until(|| dest.is_ready(), Duration::from_secs(35)).await,
        "destination should become ready again once the client reconnects"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn manual_close_on_the_dialing_side_does_not_reconnect() {
    let responder = Peer::new(&config("responder"));
    responder.role("worker");
    let addr = responder.listen("127.0.0.1:0").await.unwrap();

    let client = Peer::new(&config("client"));
    let unit = client.connect(&format!("ws://{addr}"), Default::default()).await.unwrap();
    let dest = client.destination("worker");
    assert!(dest.is_ready());

    client.close_unit(&unit.id).await;
    assert!(!dest.is_ready());

    tokio::time::sleep(Duration::from_secs(17)).await;
    assert!(!dest.is_ready(), "a manually closed unit must not reconnect");
}
