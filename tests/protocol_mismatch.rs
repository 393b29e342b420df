//! A remote that advertises an incompatible major protocol version is
//! rejected with the incompatible-protocol-version close code, and never
//! shows up as a unit.

use futures_util::{SinkExt, StreamExt};
use protocol::{MetaInfo, ParsedFrame, PeerData};
use tokio_tungstenite::tungstenite::Message;

use peerlink::{Peer, PeerConfig};

fn config(name: &str) -> PeerConfig {
    peerlink::load_config_from_str(&format!(r#"name = "{name}""#)).unwrap()
}

#[tokio::test]
async fn mismatched_major_version_is_rejected_with_4007() {
    let responder = Peer::new(&config("responder"));
    let addr = responder.listen("127.0.0.1:0").await.unwrap();

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}")).await.unwrap();

    // The responder carries no preshared keys, so it confirms immediately
    // without issuing a challenge.
    let first = ws.next().await.unwrap().unwrap();
    let Message::Binary(bytes) = first else { panic!("expected a binary frame") };
    assert!(matches!(protocol::parse_frame(&bytes).unwrap(), ParsedFrame::AuthConfirmed { .. }));

    let fake_data = PeerData {
        id: uuid::Uuid::new_v4().to_string(),
        name: "impostor".to_owned(),
        roles: vec![],
        friendly: false,
        meta: MetaInfo { os: "test".to_owned(), runtime: "test".to_owned(), uptime: 0, time: 0, protocol: "2.9.4".to_owned() },
    };
    let json = serde_json::to_vec(&fake_data).unwrap();
    let frame = protocol::serialize_frame(&ParsedFrame::AuthConfirmed { json });
    ws.send(Message::Binary(frame)).await.unwrap();

    let close = tokio::time::timeout(std::time::Duration::from_secs(2), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    match close {
        Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 4007),
        other => panic!("expected a close frame with code 4007, got {other:?}"),
    }

    assert!(responder.units().is_empty(), "an incompatible remote must never become a unit");
}
