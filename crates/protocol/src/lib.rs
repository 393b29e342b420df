//! Binary frame protocol shared by every connection a peer holds.
//!
//! A frame is a single opaque binary message whose first byte is a type
//! tag (see [`FrameTag`]). Everything past the tag is tag-specific and is
//! encoded with explicit length prefixes so the parser never needs to
//! scan for delimiters.

mod codec;
mod correlation;
mod messages;
mod value;

pub use codec::{FrameError, ParsedFrame, StreamControl, parse_frame, serialize_frame};
pub use correlation::{Correlation, MAX_CORRELATION, serialize_correlation, slice_to_correlation};
pub use messages::{Acquaint, ChallengeWithIds, MetaInfo, PeerData, ProofWithId, RolesUpdate};
pub use value::{Datatype, Value};

/// First byte of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameTag {
    Error,
    AuthChallenge,
    AuthResponse,
    AuthConfirmed,
    Message,
    Request,
    Resolve,
    ReaderRequest,
    WriterRequest,
    Reject,
    StreamData,
    StreamResolve,
    StreamReject,
    Acquaint,
    RolesUpdate,
}

impl FrameTag {
    pub const fn byte(self) -> u8 {
        match self {
            FrameTag::Error => 0,
            FrameTag::AuthChallenge => 1,
            FrameTag::AuthResponse => 2,
            FrameTag::AuthConfirmed => 3,
            FrameTag::Message => 100,
            FrameTag::Request => 101,
            FrameTag::Resolve => 102,
            FrameTag::ReaderRequest => 103,
            FrameTag::WriterRequest => 104,
            FrameTag::Reject => 105,
            FrameTag::StreamData => 106,
            FrameTag::StreamResolve => 107,
            FrameTag::StreamReject => 108,
            FrameTag::Acquaint => 200,
            FrameTag::RolesUpdate => 201,
        }
    }

    pub const fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0 => FrameTag::Error,
            1 => FrameTag::AuthChallenge,
            2 => FrameTag::AuthResponse,
            3 => FrameTag::AuthConfirmed,
            100 => FrameTag::Message,
            101 => FrameTag::Request,
            102 => FrameTag::Resolve,
            103 => FrameTag::ReaderRequest,
            104 => FrameTag::WriterRequest,
            105 => FrameTag::Reject,
            106 => FrameTag::StreamData,
            107 => FrameTag::StreamResolve,
            108 => FrameTag::StreamReject,
            200 => FrameTag::Acquaint,
            201 => FrameTag::RolesUpdate,
            _ => return None,
        })
    }
}

/// Current protocol version advertised in `peer-data`. Compatibility only
/// requires the major component to match (see [`protocol_compatible`]).
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Default send quota granted to a stream writer, in bytes.
pub const DEFAULT_QUOTA_SIZE: u64 = 16 * 1024;

/// Fraction of the quota that must be consumed before the reader hands
/// credit back to the writer.
pub const DEFAULT_QUOTA_THRESHOLD: f64 = 0.66;

/// Parses `MAJOR.MINOR.PATCH` and compares the major component only.
pub fn protocol_compatible(local: &str, remote: &str) -> bool {
    fn major(v: &str) -> Option<u64> {
        v.split('.').next()?.parse().ok()
    }
    match (major(local), major(remote)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}
