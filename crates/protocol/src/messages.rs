use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeWithIds {
    pub challenge: String,
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofWithId {
    pub proof: String,
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaInfo {
    pub os: String,
    pub runtime: String,
    pub uptime: i64,
    pub time: i64,
    pub protocol: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerData {
    pub id: String,
    pub name: String,
    pub roles: Vec<String>,
    pub friendly: bool,
    pub meta: MetaInfo,
}

/// Gossiped when a peer learns of a new address, so friendly neighbors can
/// decide whether to dial it themselves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Acquaint {
    pub address: String,
    pub id: String,
    pub roles: Vec<String>,
}

/// Sent whenever a peer's locally active role set changes. `i` is a
/// monotonic per-unit session counter; a receiver drops updates whose `i`
/// is not greater than the last one it applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolesUpdate {
    pub i: u64,
    pub roles: Vec<String>,
}
