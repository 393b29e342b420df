/// Wire-level tag for [`Value`]'s payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Datatype {
    Binary,
    Null,
    Bool,
    String,
    Number,
    Json,
}

impl Datatype {
    pub const fn byte(self) -> u8 {
        match self {
            Datatype::Binary => 0,
            Datatype::Null => 1,
            Datatype::Bool => 2,
            Datatype::String => 3,
            Datatype::Number => 4,
            Datatype::Json => 5,
        }
    }

    pub const fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0 => Datatype::Binary,
            1 => Datatype::Null,
            2 => Datatype::Bool,
            3 => Datatype::String,
            4 => Datatype::Number,
            5 => Datatype::Json,
            _ => return None,
        })
    }
}

/// Payload carried by message/request/resolve/reject frames.
///
/// `Json` keeps the raw encoded bytes rather than a `serde_json::Value`
/// so this crate stays decode-policy agnostic — callers parse it with
/// whatever type they expect on that event.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Binary(Vec<u8>),
    Null,
    Bool(bool),
    String(String),
    Number(f64),
    Json(Vec<u8>),
}

impl Value {
    pub fn datatype(&self) -> Datatype {
        match self {
            Value::Binary(_) => Datatype::Binary,
            Value::Null => Datatype::Null,
            Value::Bool(_) => Datatype::Bool,
            Value::String(_) => Datatype::String,
            Value::Number(_) => Datatype::Number,
            Value::Json(_) => Datatype::Json,
        }
    }

    /// Encodes the type-tag byte followed by the payload bytes.
    pub fn mark(&self) -> Vec<u8> {
        let mut out = vec![self.datatype().byte()];
        match self {
            Value::Binary(b) => out.extend_from_slice(b),
            Value::Null => {}
            Value::Bool(b) => out.push(u8::from(*b)),
            Value::String(s) => out.extend_from_slice(s.as_bytes()),
            Value::Number(n) => {
                let s = format!("{n:.10}");
                let trimmed = s.trim_end_matches('0').trim_end_matches('.');
                out.extend_from_slice(trimmed.as_bytes());
            }
            Value::Json(j) => out.extend_from_slice(j),
        }
        out
    }

    /// Decodes a payload previously produced by [`Value::mark`], given its
    /// datatype tag (already stripped off by the frame parser).
    pub fn retrieve(datatype: Datatype, raw: &[u8]) -> Result<Value, ValueError> {
        Ok(match datatype {
            Datatype::Binary => Value::Binary(raw.to_vec()),
            Datatype::Null => Value::Null,
            Datatype::Bool => Value::Bool(raw.first().copied().unwrap_or(0) != 0),
            Datatype::String => {
                Value::String(String::from_utf8(raw.to_vec()).map_err(|_| ValueError::BadUtf8)?)
            }
            Datatype::Number => {
                let s = std::str::from_utf8(raw).map_err(|_| ValueError::BadUtf8)?;
                Value::Number(s.parse().map_err(|_| ValueError::BadNumber)?)
            }
            Datatype::Json => Value::Json(raw.to_vec()),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ValueError {
    #[error("payload is not valid UTF-8")]
    BadUtf8,
    #[error("payload is not a valid number")]
    BadNumber,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_variant() {
        let values = vec![
            Value::Binary(vec![1, 2, 3]),
            Value::Null,
            Value::Bool(true),
            Value::Bool(false),
            Value::String("hello".to_owned()),
            Value::Number(3.5),
            Value::Number(-12.0),
            Value::Json(br#"{"a":1}"#.to_vec()),
        ];
        for v in values {
            let marked = v.mark();
            let dt = Datatype::from_byte(marked[0]).unwrap();
            let back = Value::retrieve(dt, &marked[1..]).unwrap();
            assert_eq!(v, back);
        }
    }

    #[test]
    fn number_formatting_trims_trailing_zeros() {
        assert_eq!(Value::Number(1.0).mark(), b"\x041");
    }
}
