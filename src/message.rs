//! Module that contains all the different message kinds sent in the network.
//!
//! On the wire a message is a header string plus one opaque payload string
//! (see [`crate::wire`]); here both are folded into a single tagged union so
//! every schema violation funnels through [`Error::MalformedMessage`] at
//! decode time instead of leaking into the handlers.

use crate::error::{Error, Result};
use crate::SYNC_PREFIX;

pub const HELLO: &str = "hello";
pub const GOODBYE: &str = "goodbye";
pub const NEW_RESOURCE: &str = "new_resource";
pub const LOCK_RESOURCE: &str = "lock_resource";
pub const LOCK_ACK: &str = "lock_ack";
pub const PING: &str = "ping";
pub const ASK_STATE: &str = "sync-askstate";
pub const REPLY_ASK_STATE: &str = "reply-askstate";
pub const UPDATE_RESOURCE: &str = "update_resource";

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Sender announces it entered the network.
    Hello,
    /// Sender announces it is leaving the network.
    Goodbye,
    /// A resource was created somewhere; create it locally if absent.
    NewResource { name: String, value: i64 },
    /// Ricart-Agrawala lock request, timestamp in sender-local wall-clock ms.
    LockResource { name: String, timestamp: u64 },
    /// One yes-vote for an outstanding lock request.
    LockAck { name: String },
    /// Tracker liveness probe, carrying the ids it has evicted.
    Ping { evicted: Vec<u32> },
    /// Synchronous request for the replier's full resource set.
    AskState,
    /// The resource set returned by `AskState`.
    AskStateReply { entries: Vec<(String, i64)> },
    /// Overwrite (or create) a resource's value.
    UpdateResource { name: String, value: i64 },
}

impl Payload {
    /// The header string selecting the handler for this message.
    pub fn header(&self) -> &'static str {
        match self {
            Payload::Hello => HELLO,
            Payload::Goodbye => GOODBYE,
            Payload::NewResource { .. } => NEW_RESOURCE,
            Payload::LockResource { .. } => LOCK_RESOURCE,
            Payload::LockAck { .. } => LOCK_ACK,
            Payload::Ping { .. } => PING,
            Payload::AskState => ASK_STATE,
            Payload::AskStateReply { .. } => REPLY_ASK_STATE,
            Payload::UpdateResource { .. } => UPDATE_RESOURCE,
        }
    }

    /// Whether the sender blocks for a reply on the same connection.
    pub fn is_synchronous(&self) -> bool {
        self.header().starts_with(SYNC_PREFIX)
    }

    /// Encodes the header-specific payload string.
    pub fn encode(&self) -> String {
        match self {
            Payload::Hello | Payload::Goodbye | Payload::AskState => String::new(),
            Payload::NewResource { name, value } | Payload::UpdateResource { name, value } => {
                format!("{name}|{value}")
            }
            Payload::LockResource { name, timestamp } => format!("{name}|{timestamp}"),
            Payload::LockAck { name } => name.clone(),
            Payload::Ping { evicted } => evicted
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join("|"),
            Payload::AskStateReply { entries } => entries
                .iter()
                .map(|(name, value)| format!("{name}|{value}"))
                .collect::<Vec<_>>()
                .join("&"),
        }
    }

    /// Parses a payload string per its header's schema.
    pub fn decode(header: &str, payload: &str) -> Result<Self> {
        match header {
            HELLO => Ok(Payload::Hello),
            GOODBYE => Ok(Payload::Goodbye),
            ASK_STATE => Ok(Payload::AskState),
            NEW_RESOURCE => {
                let (name, value) = parse_name_value(header, payload)?;
                Ok(Payload::NewResource { name, value })
            }
            UPDATE_RESOURCE => {
                let (name, value) = parse_name_value(header, payload)?;
                Ok(Payload::UpdateResource { name, value })
            }
            LOCK_RESOURCE => {
                let (name, rest) = split_pair(header, payload)?;
                let timestamp = rest
                    .parse::<u64>()
                    .map_err(|_| malformed(header, payload))?;
                Ok(Payload::LockResource {
                    name: name.to_owned(),
                    timestamp,
                })
            }
            LOCK_ACK => {
                if payload.is_empty() {
                    return Err(malformed(header, payload));
                }
                Ok(Payload::LockAck {
                    name: payload.to_owned(),
                })
            }
            PING => {
                let mut evicted = Vec::new();
                if !payload.is_empty() {
                    for id in payload.split('|') {
                        evicted.push(id.parse::<u32>().map_err(|_| malformed(header, payload))?);
                    }
                }
                Ok(Payload::Ping { evicted })
            }
            REPLY_ASK_STATE => {
                let mut entries = Vec::new();
                if !payload.is_empty() {
                    for pair in payload.split('&') {
                        entries.push(parse_name_value(header, pair)?);
                    }
                }
                Ok(Payload::AskStateReply { entries })
            }
            _ => Err(Error::MalformedMessage(format!("unknown header: {header}"))),
        }
    }
}

fn malformed(header: &str, payload: &str) -> Error {
    Error::MalformedMessage(format!("bad payload for {header}: {payload:?}"))
}

fn split_pair<'a>(header: &str, payload: &'a str) -> Result<(&'a str, &'a str)> {
    match payload.split_once('|') {
        Some((name, rest)) if !name.is_empty() => Ok((name, rest)),
        _ => Err(malformed(header, payload)),
    }
}

fn parse_name_value(header: &str, payload: &str) -> Result<(String, i64)> {
    let (name, rest) = split_pair(header, payload)?;
    let value = rest.parse::<i64>().map_err(|_| malformed(header, payload))?;
    Ok((name.to_owned(), value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_kind() {
        let messages = [
            Payload::Hello,
            Payload::Goodbye,
            Payload::NewResource {
                name: "gold".into(),
                value: 10,
            },
            Payload::LockResource {
                name: "gold".into(),
                timestamp: 1_700_000_000_123,
            },
            Payload::LockAck {
                name: "gold".into(),
            },
            Payload::Ping {
                evicted: vec![3, 7],
            },
            Payload::AskState,
            Payload::AskStateReply {
                entries: vec![("gold".into(), 10), ("silver".into(), -4)],
            },
            Payload::UpdateResource {
                name: "gold".into(),
                value: 42,
            },
        ];
        for message in messages {
            let decoded = Payload::decode(message.header(), &message.encode()).unwrap();
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn empty_ping_and_state_reply_decode_to_empty_lists() {
        assert_eq!(
            Payload::decode(PING, "").unwrap(),
            Payload::Ping { evicted: vec![] }
        );
        assert_eq!(
            Payload::decode(REPLY_ASK_STATE, "").unwrap(),
            Payload::AskStateReply { entries: vec![] }
        );
    }

    #[test]
    fn only_ask_state_is_synchronous() {
        assert!(Payload::AskState.is_synchronous());
        assert!(!Payload::Hello.is_synchronous());
        assert!(!Payload::AskStateReply { entries: vec![] }.is_synchronous());
    }

    #[test]
    fn rejects_schema_violations() {
        let cases = [
            (NEW_RESOURCE, "gold"),
            (NEW_RESOURCE, "gold|not-a-number"),
            (NEW_RESOURCE, "|5"),
            (LOCK_RESOURCE, "gold|-1"),
            (LOCK_ACK, ""),
            (PING, "1|x"),
            (REPLY_ASK_STATE, "gold|1&silver"),
            ("no_such_header", ""),
        ];
        for (header, payload) in cases {
            assert!(
                matches!(
                    Payload::decode(header, payload),
                    Err(Error::MalformedMessage(_))
                ),
                "{header}:{payload} should be malformed"
            );
        }
    }
}
