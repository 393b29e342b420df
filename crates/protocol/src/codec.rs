use crate::correlation::{Correlation, serialize_correlation, slice_to_correlation};
use crate::value::{Datatype, Value};
use crate::FrameTag;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame is empty")]
    Empty,
    #[error("unrecognized frame type byte: {0}")]
    UnknownTag(u8),
    #[error("unrecognized data type byte: {0}")]
    UnknownDatatype(u8),
    #[error("unrecognized stream control byte: {0}")]
    UnknownStreamControl(u8),
    #[error("frame is shorter than its own length fields declare")]
    Truncated,
    #[error("role/event name is not valid UTF-8")]
    BadUtf8,
    #[error(transparent)]
    Value(#[from] crate::value::ValueError),
}

/// Stream-data sub-frame payload (see [`FrameTag::StreamData`]).
#[derive(Debug, Clone, PartialEq)]
pub enum StreamControl {
    Chunk(Vec<u8>),
    Finish,
    Error(String),
    Quota(u64),
}

impl StreamControl {
    const fn byte(&self) -> u8 {
        match self {
            StreamControl::Chunk(_) => 0,
            StreamControl::Finish => 1,
            StreamControl::Error(_) => 2,
            StreamControl::Quota(_) => 3,
        }
    }
}

/// A fully decoded frame, tagged by kind.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedFrame {
    Error { message: String },
    AuthChallenge { json: Vec<u8> },
    AuthResponse { json: Vec<u8> },
    AuthConfirmed { json: Vec<u8> },
    Message { role: String, event: String, value: Value },
    Request { role: String, event: String, corr: Correlation, value: Value },
    Resolve { corr: Correlation, value: Value },
    ReaderRequest {
        role: String,
        event: String,
        corr: Correlation,
        channel: Correlation,
        value: Value,
    },
    WriterRequest {
        role: String,
        event: String,
        corr: Correlation,
        channel: Correlation,
        value: Value,
    },
    Reject { corr: Correlation, value: Value },
    StreamData { channel: Correlation, control: StreamControl },
    StreamResolve { corr: Correlation, channel: Correlation, value: Value },
    StreamReject { corr: Correlation, channel: Correlation, value: Value },
    Acquaint { json: Vec<u8> },
    RolesUpdate { json: Vec<u8> },
}

fn len16(n: usize) -> [u8; 2] {
    (n as u16).to_be_bytes()
}

fn read_len16(raw: &[u8], at: usize) -> Result<usize, FrameError> {
    raw.get(at..at + 2)
        .map(|b| usize::from(u16::from_be_bytes([b[0], b[1]])))
        .ok_or(FrameError::Truncated)
}

fn utf8(bytes: &[u8]) -> Result<String, FrameError> {
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|_| FrameError::BadUtf8)
}

pub fn serialize_frame(frame: &ParsedFrame) -> Vec<u8> {
    match frame {
        ParsedFrame::Error { message } => {
            let mut out = vec![FrameTag::Error.byte()];
            out.extend_from_slice(message.as_bytes());
            out
        }
        ParsedFrame::AuthChallenge { json } => prefixed(FrameTag::AuthChallenge, json),
        ParsedFrame::AuthResponse { json } => prefixed(FrameTag::AuthResponse, json),
        ParsedFrame::AuthConfirmed { json } => prefixed(FrameTag::AuthConfirmed, json),
        ParsedFrame::Acquaint { json } => prefixed(FrameTag::Acquaint, json),
        ParsedFrame::RolesUpdate { json } => prefixed(FrameTag::RolesUpdate, json),

        ParsedFrame::Message { role, event, value } => {
            let mut out = vec![FrameTag::Message.byte()];
            out.extend_from_slice(&len16(role.len()));
            out.extend_from_slice(&len16(event.len()));
            out.extend_from_slice(role.as_bytes());
            out.extend_from_slice(event.as_bytes());
            out.extend_from_slice(&value.mark());
            out
        }
        ParsedFrame::Request { role, event, corr, value } => {
            let bin_cor = serialize_correlation(*corr);
            let mut out = vec![FrameTag::Request.byte()];
            out.extend_from_slice(&len16(role.len()));
            out.extend_from_slice(&len16(event.len()));
            out.push(bin_cor.len() as u8);
            out.extend_from_slice(role.as_bytes());
            out.extend_from_slice(event.as_bytes());
            out.extend_from_slice(&bin_cor);
            out.extend_from_slice(&value.mark());
            out
        }
        ParsedFrame::ReaderRequest { role, event, corr, channel, value } => {
            serialize_stream_request(FrameTag::ReaderRequest, role, event, *corr, *channel, value)
        }
        ParsedFrame::WriterRequest { role, event, corr, channel, value } => {
            serialize_stream_request(FrameTag::WriterRequest, role, event, *corr, *channel, value)
        }
        ParsedFrame::Resolve { corr, value } => serialize_response(FrameTag::Resolve, *corr, value),
        ParsedFrame::Reject { corr, value } => serialize_response(FrameTag::Reject, *corr, value),
        ParsedFrame::StreamResolve { corr, channel, value } => {
            serialize_stream_response(FrameTag::StreamResolve, *corr, *channel, value)
        }
        ParsedFrame::StreamReject { corr, channel, value } => {
            serialize_stream_response(FrameTag::StreamReject, *corr, *channel, value)
        }
        ParsedFrame::StreamData { channel, control } => {
            let bin_chan = serialize_correlation(*channel);
            let mut out = vec![FrameTag::StreamData.byte()];
            out.push(bin_chan.len() as u8);
            out.extend_from_slice(&bin_chan);
            out.push(control.byte());
            match control {
                StreamControl::Chunk(payload) => out.extend_from_slice(payload),
                StreamControl::Finish => {}
                StreamControl::Error(msg) => out.extend_from_slice(msg.as_bytes()),
                StreamControl::Quota(n) => out.extend_from_slice(&n.to_be_bytes()),
            }
            out
        }
    }
}

fn prefixed(tag: FrameTag, json: &[u8]) -> Vec<u8> {
    let mut out = vec![tag.byte()];
    out.extend_from_slice(json);
    out
}

fn serialize_stream_request(
    tag: FrameTag,
    role: &str,
    event: &str,
    corr: Correlation,
    channel: Correlation,
    value: &Value,
) -> Vec<u8> {
    let bin_cor = serialize_correlation(corr);
    let bin_chan = serialize_correlation(channel);
    let mut out = vec![tag.byte()];
    out.extend_from_slice(&len16(role.len()));
    out.extend_from_slice(&len16(event.len()));
    out.push(bin_cor.len() as u8);
    out.push(bin_chan.len() as u8);
    out.extend_from_slice(role.as_bytes());
    out.extend_from_slice(event.as_bytes());
    out.extend_from_slice(&bin_cor);
    out.extend_from_slice(&bin_chan);
    out.extend_from_slice(&value.mark());
    out
}

fn serialize_response(tag: FrameTag, corr: Correlation, value: &Value) -> Vec<u8> {
    let bin_cor = serialize_correlation(corr);
    let mut out = vec![tag.byte()];
    out.push(bin_cor.len() as u8);
    out.extend_from_slice(&bin_cor);
    out.extend_from_slice(&value.mark());
    out
}

fn serialize_stream_response(
    tag: FrameTag,
    corr: Correlation,
    channel: Correlation,
    value: &Value,
) -> Vec<u8> {
    let bin_cor = serialize_correlation(corr);
    let bin_chan = serialize_correlation(channel);
    let mut out = vec![tag.byte()];
    out.push(bin_cor.len() as u8);
    out.push(bin_chan.len() as u8);
    out.extend_from_slice(&bin_cor);
    out.extend_from_slice(&bin_chan);
    out.extend_from_slice(&value.mark());
    out
}

pub fn parse_frame(raw: &[u8]) -> Result<ParsedFrame, FrameError> {
    let (&tag_byte, body) = raw.split_first().ok_or(FrameError::Empty)?;
    let tag = FrameTag::from_byte(tag_byte).ok_or(FrameError::UnknownTag(tag_byte))?;
    Ok(match tag {
        FrameTag::Error => ParsedFrame::Error { message: utf8(body)? },
        FrameTag::AuthChallenge => ParsedFrame::AuthChallenge { json: body.to_vec() },
        FrameTag::AuthResponse => ParsedFrame::AuthResponse { json: body.to_vec() },
        FrameTag::AuthConfirmed => ParsedFrame::AuthConfirmed { json: body.to_vec() },
        FrameTag::Acquaint => ParsedFrame::Acquaint { json: body.to_vec() },
        FrameTag::RolesUpdate => ParsedFrame::RolesUpdate { json: body.to_vec() },

        FrameTag::Message => {
            let role_len = read_len16(body, 0)?;
            let event_len = read_len16(body, 2)?;
            let role_from = 4;
            let event_from = role_from + role_len;
            let type_pos = event_from + event_len;
            let role = utf8(slice(body, role_from, event_from)?)?;
            let event = utf8(slice(body, event_from, type_pos)?)?;
            let dt = *body.get(type_pos).ok_or(FrameError::Truncated)?;
            let datatype = Datatype::from_byte(dt).ok_or(FrameError::UnknownDatatype(dt))?;
            let value = Value::retrieve(datatype, slice(body, type_pos + 1, body.len())?)?;
            ParsedFrame::Message { role, event, value }
        }
        FrameTag::Request => {
            let role_len = read_len16(body, 0)?;
            let event_len = read_len16(body, 2)?;
            let cor_len = usize::from(*body.get(4).ok_or(FrameError::Truncated)?);
            let role_from = 5;
            let event_from = role_from + role_len;
            let cor_from = event_from + event_len;
            let type_pos = cor_from + cor_len;
            let role = utf8(slice(body, role_from, event_from)?)?;
            let event = utf8(slice(body, event_from, cor_from)?)?;
            let corr = slice_to_correlation(slice(body, cor_from, type_pos)?);
            let dt = *body.get(type_pos).ok_or(FrameError::Truncated)?;
            let datatype = Datatype::from_byte(dt).ok_or(FrameError::UnknownDatatype(dt))?;
            let value = Value::retrieve(datatype, slice(body, type_pos + 1, body.len())?)?;
            ParsedFrame::Request { role, event, corr, value }
        }
        FrameTag::ReaderRequest | FrameTag::WriterRequest => {
            let role_len = read_len16(body, 0)?;
            let event_len = read_len16(body, 2)?;
            let cor_len = usize::from(*body.get(4).ok_or(FrameError::Truncated)?);
            let chan_len = usize::from(*body.get(5).ok_or(FrameError::Truncated)?);
            let role_from = 6;
            let event_from = role_from + role_len;
            let cor_from = event_from + event_len;
            let chan_from = cor_from + cor_len;
            let type_pos = chan_from + chan_len;
            let role = utf8(slice(body, role_from, event_from)?)?;
            let event = utf8(slice(body, event_from, cor_from)?)?;
            let corr = slice_to_correlation(slice(body, cor_from, chan_from)?);
            let channel = slice_to_correlation(slice(body, chan_from, type_pos)?);
            let dt = *body.get(type_pos).ok_or(FrameError::Truncated)?;
            let datatype = Datatype::from_byte(dt).ok_or(FrameError::UnknownDatatype(dt))?;
            let value = Value::retrieve(datatype, slice(body, type_pos + 1, body.len())?)?;
            if tag == FrameTag::ReaderRequest {
                ParsedFrame::ReaderRequest { role, event, corr, channel, value }
            } else {
                ParsedFrame::WriterRequest { role, event, corr, channel, value }
            }
        }
        FrameTag::Resolve | FrameTag::Reject => {
            let cor_len = usize::from(*body.first().ok_or(FrameError::Truncated)?);
            let corr = slice_to_correlation(slice(body, 1, 1 + cor_len)?);
            let type_pos = 1 + cor_len;
            let dt = *body.get(type_pos).ok_or(FrameError::Truncated)?;
            let datatype = Datatype::from_byte(dt).ok_or(FrameError::UnknownDatatype(dt))?;
            let value = Value::retrieve(datatype, slice(body, type_pos + 1, body.len())?)?;
            if tag == FrameTag::Resolve {
                ParsedFrame::Resolve { corr, value }
            } else {
                ParsedFrame::Reject { corr, value }
            }
        }
        FrameTag::StreamResolve | FrameTag::StreamReject => {
            let cor_len = usize::from(*body.first().ok_or(FrameError::Truncated)?);
            let chan_len = usize::from(*body.get(1).ok_or(FrameError::Truncated)?);
            let corr = slice_to_correlation(slice(body, 2, 2 + cor_len)?);
            let channel = slice_to_correlation(slice(body, 2 + cor_len, 2 + cor_len + chan_len)?);
            // NOTE: the type-tag byte sits after corr+channel, not 2*chan_len.
            let type_pos = 2 + cor_len + chan_len;
            let dt = *body.get(type_pos).ok_or(FrameError::Truncated)?;
            let datatype = Datatype::from_byte(dt).ok_or(FrameError::UnknownDatatype(dt))?;
            let value = Value::retrieve(datatype, slice(body, type_pos + 1, body.len())?)?;
            if tag == FrameTag::StreamResolve {
                ParsedFrame::StreamResolve { corr, channel, value }
            } else {
                ParsedFrame::StreamReject { corr, channel, value }
            }
        }
        FrameTag::StreamData => {
            let chan_len = usize::from(*body.first().ok_or(FrameError::Truncated)?);
            let channel = slice_to_correlation(slice(body, 1, 1 + chan_len)?);
            let ctrl_pos = 1 + chan_len;
            let ctrl_byte = *body.get(ctrl_pos).ok_or(FrameError::Truncated)?;
            let payload = slice(body, ctrl_pos + 1, body.len())?;
            let control = match ctrl_byte {
                0 => StreamControl::Chunk(payload.to_vec()),
                1 => StreamControl::Finish,
                2 => StreamControl::Error(utf8(payload)?),
                3 => {
                    if payload.len() > 8 {
                        return Err(FrameError::Truncated);
                    }
                    let mut buf = [0u8; 8];
                    buf[8 - payload.len()..].copy_from_slice(payload);
                    StreamControl::Quota(u64::from_be_bytes(buf))
                }
                other => return Err(FrameError::UnknownStreamControl(other)),
            };
            ParsedFrame::StreamData { channel, control }
        }
    })
}

fn slice(body: &[u8], from: usize, to: usize) -> Result<&[u8], FrameError> {
    if to > body.len() || from > to {
        return Err(FrameError::Truncated);
    }
    Ok(&body[from..to])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: ParsedFrame) {
        let bytes = serialize_frame(&frame);
        let back = parse_frame(&bytes).unwrap();
        assert_eq!(frame, back);
    }

    #[test]
    fn message_round_trips() {
        roundtrip(ParsedFrame::Message {
            role: "echo".into(),
            event: "ping".into(),
            value: Value::Bool(true),
        });
    }

    #[test]
    fn request_round_trips_with_large_correlation() {
        roundtrip(ParsedFrame::Request {
            role: "echo".into(),
            event: "test".into(),
            corr: crate::correlation::MAX_CORRELATION,
            value: Value::String("hi".into()),
        });
    }

    #[test]
    fn reader_request_round_trips() {
        roundtrip(ParsedFrame::ReaderRequest {
            role: "files".into(),
            event: "download".into(),
            corr: 42,
            channel: 7,
            value: Value::Null,
        });
    }

    #[test]
    fn stream_resolve_round_trips_with_distinct_corr_and_channel_lengths() {
        // corr needs 2 bytes, channel needs 1 — this is exactly the case the
        // reference parser's offset bug would have mishandled.
        roundtrip(ParsedFrame::StreamResolve {
            corr: 300,
            channel: 5,
            value: Value::Json(br#"{"ok":true}"#.to_vec()),
        });
    }

    #[test]
    fn stream_reject_round_trips_with_distinct_corr_and_channel_lengths() {
        roundtrip(ParsedFrame::StreamReject {
            corr: 70000,
            channel: 1,
            value: Value::String("nope".into()),
        });
    }

    #[test]
    fn stream_data_chunk_round_trips() {
        roundtrip(ParsedFrame::StreamData {
            channel: 9,
            control: StreamControl::Chunk(vec![1, 2, 3, 4]),
        });
    }

    #[test]
    fn stream_data_quota_round_trips() {
        roundtrip(ParsedFrame::StreamData {
            channel: 9,
            control: StreamControl::Quota(16384),
        });
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert!(matches!(parse_frame(&[250]), Err(FrameError::UnknownTag(250))));
    }

    #[test]
    fn empty_frame_is_rejected() {
        assert!(matches!(parse_frame(&[]), Err(FrameError::Empty)));
    }
}
