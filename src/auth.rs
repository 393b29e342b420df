//! Mutual preshared-key authentication, run once immediately after a
//! transport opens. Both directions must confirm before the unit is
//! considered connected.

use std::time::Duration;

use futures_util::StreamExt;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use tokio_tungstenite::tungstenite::Message;

use protocol::{ChallengeWithIds, ParsedFrame, PeerData, ProofWithId};

use crate::config::PresharedKeyConfig;
use crate::conn::{BoxedStream, Connection};
use crate::error::HandshakeError;

pub const AUTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs the challenge/response handshake to completion and returns the
/// remote's advertised peer-data.
pub async fn perform_handshake(
    conn: &Connection,
    stream: &mut BoxedStream,
    local_keys: &[PresharedKeyConfig],
    local_peer_data: &PeerData,
) -> Result<PeerData, HandshakeError> {
    tokio::time::timeout(AUTH_TIMEOUT, run(conn, stream, local_keys, local_peer_data))
        .await
        .map_err(|_| HandshakeError::Timeout(AUTH_TIMEOUT))?
}

async fn run(
    conn: &Connection,
    stream: &mut BoxedStream,
    local_keys: &[PresharedKeyConfig],
    local_peer_data: &PeerData,
) -> Result<PeerData, HandshakeError> {
    let mut confirmed_in = false;
    let mut confirmed_out = false;
    let mut our_challenge: Option<String> = None;
    let mut remote_data: Option<PeerData> = None;

    if local_keys.is_empty() {
        confirmed_in = true;
        send_confirmed(conn, local_peer_data).await?;
    } else {
        let challenge = generate_challenge();
        let ids = local_keys.iter().map(|k| k.id.clone()).collect();
        let payload = serde_json::to_vec(&ChallengeWithIds { challenge: challenge.clone(), ids })
            .expect("ChallengeWithIds always serializes");
        conn.write_frame(&ParsedFrame::AuthChallenge { json: payload }).await?;
        our_challenge = Some(challenge);
    }

    loop {
        if confirmed_in && confirmed_out {
            return Ok(remote_data.expect("both directions confirmed implies peer data was stored"));
        }
        let msg = stream
            .next()
            .await
            .ok_or(HandshakeError::ConnectionClosed)??;
        let bytes = match msg {
            Message::Binary(b) => b,
            Message::Ping(payload) => {
                conn.write_raw(Message::Pong(payload)).await?;
                continue;
            }
            Message::Pong(_) => continue,
            Message::Close(_) => return Err(HandshakeError::ConnectionClosed),
            Message::Text(_) | Message::Frame(_) => return Err(HandshakeError::UnexpectedFrame),
        };
        let frame = protocol::parse_frame(&bytes)?;
        match frame {
            ParsedFrame::Error { message } => return Err(HandshakeError::RemoteError(message)),
            ParsedFrame::AuthConfirmed { json } => {
                let data: PeerData = serde_json::from_slice(&json).map_err(HandshakeError::BadPeerData)?;
                remote_data = Some(data);
                confirmed_out = true;
            }
            ParsedFrame::AuthChallenge { json } => {
                let challenge: ChallengeWithIds =
                    serde_json::from_slice(&json).map_err(HandshakeError::BadPeerData)?;
                let key = local_keys
                    .iter()
                    .find(|k| challenge.ids.contains(&k.id))
                    .ok_or(HandshakeError::NoMatchingKey)?;
                let proof = compute_proof(&challenge.challenge, &key.secret);
                let payload = serde_json::to_vec(&ProofWithId { proof, id: key.id.clone() })
                    .expect("ProofWithId always serializes");
                conn.write_frame(&ParsedFrame::AuthResponse { json: payload }).await?;
            }
            ParsedFrame::AuthResponse { json } => {
                let challenge = our_challenge
                    .as_deref()
                    .ok_or(HandshakeError::UnexpectedFrame)?;
                let proof: ProofWithId =
                    serde_json::from_slice(&json).map_err(HandshakeError::BadPeerData)?;
                let key = local_keys
                    .iter()
                    .find(|k| k.id == proof.id)
                    .ok_or_else(|| HandshakeError::UnknownKeyId(proof.id.clone()))?;
                let expected = compute_proof(challenge, &key.secret);
                if !constant_time_eq(expected.as_bytes(), proof.proof.as_bytes()) {
                    return Err(HandshakeError::ProofMismatch(proof.id));
                }
                confirmed_in = true;
                send_confirmed(conn, local_peer_data).await?;
            }
            _ => return Err(HandshakeError::UnexpectedFrame),
        }
    }
}

async fn send_confirmed(conn: &Connection, peer_data: &PeerData) -> Result<(), HandshakeError> {
    let json = serde_json::to_vec(peer_data).expect("PeerData always serializes");
    conn.write_frame(&ParsedFrame::AuthConfirmed { json }).await?;
    Ok(())
}

fn generate_challenge() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn compute_proof(challenge: &str, secret: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(challenge.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proof_is_deterministic_for_same_inputs() {
        let a = compute_proof("abc123", "secret");
        let b = compute_proof("abc123", "secret");
        assert_eq!(a, b);
    }

    #[test]
    fn proof_differs_for_different_secrets() {
        let a = compute_proof("abc123", "secret1");
        let b = compute_proof("abc123", "secret2");
        assert_ne!(a, b);
    }

    #[test]
    fn constant_time_eq_matches_native_comparison() {
        assert!(constant_time_eq(b"abcdef", b"abcdef"));
        assert!(!constant_time_eq(b"abcdef", b"abcdeg"));
        assert!(!constant_time_eq(b"short", b"longer"));
    }
}
