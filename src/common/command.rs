//! Mutation command codec
//!
//! Commands are stored in the replicated log as UTF-8 JSON:
//! `{"op":"set","key":"k","value":"v"}` or `{"op":"delete","key":"k"}`.
//! The format is persisted, so it must stay stable across versions.

use crate::common::{Error, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Mutation kind carried by a command.
///
/// `Unknown` keeps whatever op string was found in the log so every replica
/// can skip it the same way instead of failing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Operation {
    Set,
    Delete,
    Unknown(String),
}

impl From<String> for Operation {
    fn from(op: String) -> Self {
        match op.as_str() {
            "set" => Operation::Set,
            "delete" => Operation::Delete,
            _ => Operation::Unknown(op),
        }
    }
}

impl From<Operation> for String {
    fn from(op: Operation) -> Self {
        match op {
            Operation::Set => "set".to_string(),
            Operation::Delete => "delete".to_string(),
            Operation::Unknown(op) => op,
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Set => write!(f, "set"),
            Operation::Delete => write!(f, "delete"),
            Operation::Unknown(op) => write!(f, "{}", op),
        }
    }
}

/// A single mutation of the replicated mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub op: Operation,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl Command {
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            op: Operation::Set,
            key: key.into(),
            value: Some(value.into()),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            op: Operation::Delete,
            key: key.into(),
            value: None,
        }
    }

    /// Check the shape a client-submitted command must have.
    ///
    /// Only the gateway calls this; entries already in the log are trusted.
    pub fn validate(&self) -> Result<()> {
        if self.key.is_empty() {
            return Err(Error::InvalidRequest("key must not be empty".into()));
        }
        match (&self.op, &self.value) {
            (Operation::Set, Some(value)) if !value.is_empty() => Ok(()),
            (Operation::Set, _) => Err(Error::InvalidRequest(format!(
                "set {} requires a non-empty value",
                self.key
            ))),
            (Operation::Delete, None) => Ok(()),
            (Operation::Delete, Some(_)) => Err(Error::InvalidRequest(format!(
                "delete {} must not carry a value",
                self.key
            ))),
            (Operation::Unknown(op), _) => {
                Err(Error::InvalidRequest(format!("unsupported op: {}", op)))
            }
        }
    }
}

/// Encode a command into its log payload.
pub fn encode(cmd: &Command) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(cmd)?))
}

/// Decode a log payload back into a command.
pub fn decode(payload: &[u8]) -> Result<Command> {
    serde_json::from_slice(payload).map_err(|e| Error::MalformedCommand(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        let set = encode(&Command::set("k1", "v1")).unwrap();
        assert_eq!(&set[..], br#"{"op":"set","key":"k1","value":"v1"}"#);

        let delete = encode(&Command::delete("k1")).unwrap();
        assert_eq!(&delete[..], br#"{"op":"delete","key":"k1"}"#);
    }

    #[test]
    fn test_decode_unknown_op() {
        let cmd = decode(br#"{"op":"incr","key":"counter"}"#).unwrap();
        assert_eq!(cmd.op, Operation::Unknown("incr".into()));
        assert_eq!(cmd.key, "counter");
    }

    #[test]
    fn test_decode_malformed() {
        assert!(matches!(
            decode(b"not json"),
            Err(Error::MalformedCommand(_))
        ));
        assert!(matches!(
            decode(br#"{"key":"missing-op"}"#),
            Err(Error::MalformedCommand(_))
        ));
        assert!(matches!(
            decode(br#"{"op":"set","key":42}"#),
            Err(Error::MalformedCommand(_))
        ));
    }

    #[test]
    fn test_validate() {
        assert!(Command::set("k", "v").validate().is_ok());
        assert!(Command::delete("k").validate().is_ok());
        assert!(Command::set("", "v").validate().is_err());
        assert!(Command::set("k", "").validate().is_err());
        assert!(Command::delete("").validate().is_err());

        let mut bad = Command::delete("k");
        bad.value = Some("v".into());
        assert!(bad.validate().is_err());

        let unknown = Command {
            op: Operation::Unknown("incr".into()),
            key: "k".into(),
            value: None,
        };
        assert!(unknown.validate().is_err());
    }
}
