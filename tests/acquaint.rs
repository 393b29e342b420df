//! Three friendly peers, only one of which dials the other two directly:
//! the third peer's destination still becomes ready once the dialer
//! gossips the address it learned about to the peer that wants it.

use std::time::Duration;

use peerlink::{ConnectOptions, Peer, PeerConfig};

fn config(name: &str) -> PeerConfig {
    peerlink::load_config_from_str(&format!(r#"name = "{name}"
friendly = true"#))
    .unwrap()
}

async fn wait_until(mut check: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

#[tokio::test]
async fn third_party_destination_becomes_ready_through_gossip() {
    let p1 = Peer::new(&config("p1"));
    p1.role("worker");
    let p1_addr = p1.listen("127.0.0.1:0").await.unwrap();

    let p3 = Peer::new(&config("p3"));
    let p3_addr = p3.listen("127.0.0.1:0").await.unwrap();
    let dest = p3.destination("worker");
    assert!(!dest.is_ready());

    // p2 must also be friendly: the acquaint hint it relays to p3 only gets
    // accepted if p3 considers the unit it arrived on (p2) friendly.
    let p2 = Peer::new(&config("p2"));
    p2.connect(&format!("ws://{p1_addr}"), ConnectOptions::default()).await.unwrap();
    p2.connect(&format!("ws://{p3_addr}"), ConnectOptions::default()).await.unwrap();

    assert!(
        wait_until(|| dest.is_ready(), Duration::from_secs(2)).await,
        "p3 should have dialed p1 directly once p2 gossiped its address"
    );
    assert_eq!(p3.units().len(), 2, "p3 should now hold a unit for both p2 and p1");
}
