//! NIP-01 wire messages.
//!
//! The transport parses and frames these; the engine only needs their shapes.
//! Both directions are closed enums so routing code matches exhaustively.

use crate::error::Error;
use crate::filter::Filter;
use nostr::{Event, EventId, SubscriptionId};
use serde_json::{json, Value};

/// Messages sent from the client to a relay.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Req {
        subscription_id: SubscriptionId,
        filters: Vec<Filter>,
    },
    Close(SubscriptionId),
    Event(Box<Event>),
    Count {
        subscription_id: SubscriptionId,
        filters: Vec<Filter>,
    },
    Auth(Box<Event>),
}

impl ClientMessage {
    pub fn as_json(&self) -> String {
        let value = match self {
            ClientMessage::Req {
                subscription_id,
                filters,
            } => frame_with_filters("REQ", subscription_id, filters),
            ClientMessage::Close(subscription_id) => json!(["CLOSE", subscription_id.to_string()]),
            ClientMessage::Event(event) => json!(["EVENT", event]),
            ClientMessage::Count {
                subscription_id,
                filters,
            } => frame_with_filters("COUNT", subscription_id, filters),
            ClientMessage::Auth(event) => json!(["AUTH", event]),
        };
        value.to_string()
    }
}

fn frame_with_filters(verb: &str, subscription_id: &SubscriptionId, filters: &[Filter]) -> Value {
    let mut frame = vec![json!(verb), json!(subscription_id.to_string())];
    frame.extend(filters.iter().map(Filter::to_value));
    Value::Array(frame)
}

/// Messages received from a relay.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    Event {
        subscription_id: SubscriptionId,
        event: Box<Event>,
    },
    EndOfStoredEvents(SubscriptionId),
    Notice(String),
    Ok {
        event_id: EventId,
        status: bool,
        message: String,
    },
    Auth {
        challenge: String,
    },
    Closed {
        subscription_id: SubscriptionId,
        message: String,
    },
    Count {
        subscription_id: SubscriptionId,
        count: u64,
    },
}

impl RelayMessage {
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let value: Value = serde_json::from_str(json)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, Error> {
        let Value::Array(mut frame) = value else {
            return Err(Error::invalid_message("relay message must be a JSON array"));
        };
        if frame.is_empty() {
            return Err(Error::invalid_message("empty relay message"));
        }

        let verb = match frame.remove(0) {
            Value::String(verb) => verb,
            other => {
                return Err(Error::invalid_message(format!(
                    "message type must be a string, found {}",
                    other
                )))
            }
        };

        match verb.as_str() {
            "EVENT" => {
                expect_len(&verb, &frame, 2)?;
                let subscription_id = subscription_id_at(&frame, 0)?;
                let event: Event = serde_json::from_value(frame.remove(1))?;
                Ok(RelayMessage::Event {
                    subscription_id,
                    event: Box::new(event),
                })
            }
            "EOSE" => {
                expect_len(&verb, &frame, 1)?;
                Ok(RelayMessage::EndOfStoredEvents(subscription_id_at(
                    &frame, 0,
                )?))
            }
            "NOTICE" => {
                expect_len(&verb, &frame, 1)?;
                Ok(RelayMessage::Notice(string_at(&frame, 0)?))
            }
            "OK" => {
                expect_len(&verb, &frame, 3)?;
                let event_id = EventId::from_hex(&string_at(&frame, 0)?)
                    .map_err(|e| Error::invalid_message(format!("invalid event id: {}", e)))?;
                let status = frame[1]
                    .as_bool()
                    .ok_or_else(|| Error::invalid_message("OK status must be a boolean"))?;
                Ok(RelayMessage::Ok {
                    event_id,
                    status,
                    message: string_at(&frame, 2)?,
                })
            }
            "AUTH" => {
                expect_len(&verb, &frame, 1)?;
                Ok(RelayMessage::Auth {
                    challenge: string_at(&frame, 0)?,
                })
            }
            "CLOSED" => {
                expect_len(&verb, &frame, 2)?;
                Ok(RelayMessage::Closed {
                    subscription_id: subscription_id_at(&frame, 0)?,
                    message: string_at(&frame, 1)?,
                })
            }
            "COUNT" => {
                expect_len(&verb, &frame, 2)?;
                let count = frame[1]
                    .get("count")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| Error::invalid_message("COUNT payload must carry a count"))?;
                Ok(RelayMessage::Count {
                    subscription_id: subscription_id_at(&frame, 0)?,
                    count,
                })
            }
            _ => Err(Error::invalid_message(format!(
                "unknown message type {}",
                verb
            ))),
        }
    }

    pub fn as_json(&self) -> String {
        let value = match self {
            RelayMessage::Event {
                subscription_id,
                event,
            } => json!(["EVENT", subscription_id.to_string(), event]),
            RelayMessage::EndOfStoredEvents(subscription_id) => {
                json!(["EOSE", subscription_id.to_string()])
            }
            RelayMessage::Notice(message) => json!(["NOTICE", message]),
            RelayMessage::Ok {
                event_id,
                status,
                message,
            } => json!(["OK", event_id.to_hex(), status, message]),
            RelayMessage::Auth { challenge } => json!(["AUTH", challenge]),
            RelayMessage::Closed {
                subscription_id,
                message,
            } => json!(["CLOSED", subscription_id.to_string(), message]),
            RelayMessage::Count {
                subscription_id,
                count,
            } => json!(["COUNT", subscription_id.to_string(), { "count": count }]),
        };
        value.to_string()
    }
}

fn expect_len(verb: &str, frame: &[Value], len: usize) -> Result<(), Error> {
    if frame.len() < len {
        return Err(Error::invalid_message(format!(
            "{} expects {} argument(s), found {}",
            verb,
            len,
            frame.len()
        )));
    }
    Ok(())
}

fn string_at(frame: &[Value], index: usize) -> Result<String, Error> {
    frame[index]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| Error::invalid_message(format!("argument {} must be a string", index)))
}

fn subscription_id_at(frame: &[Value], index: usize) -> Result<SubscriptionId, Error> {
    string_at(frame, index).map(SubscriptionId::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{create_test_event, kind};
    use nostr::Keys;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_req_frame_layout() {
        let message = ClientMessage::Req {
            subscription_id: SubscriptionId::new("sub-1"),
            filters: vec![
                Filter::new().kind(kind(1)).limit(10),
                Filter::new().tag("t", ["nostr"]),
            ],
        };

        assert_eq!(
            message.as_json(),
            r##"["REQ","sub-1",{"kinds":[1],"limit":10},{"#t":["nostr"]}]"##
        );
        assert_eq!(
            ClientMessage::Close(SubscriptionId::new("sub-1")).as_json(),
            r#"["CLOSE","sub-1"]"#
        );
    }

    #[test]
    fn test_parse_event_message() {
        let event = create_test_event(&Keys::generate(), 1, vec![], "hello");
        let message = RelayMessage::Event {
            subscription_id: SubscriptionId::new("sub-1"),
            event: Box::new(event),
        };

        assert_eq!(RelayMessage::from_json(&message.as_json()).unwrap(), message);
    }

    #[test]
    fn test_parse_control_messages() {
        assert_eq!(
            RelayMessage::from_json(r#"["EOSE","sub-1"]"#).unwrap(),
            RelayMessage::EndOfStoredEvents(SubscriptionId::new("sub-1"))
        );
        assert_eq!(
            RelayMessage::from_json(r#"["NOTICE","slow down"]"#).unwrap(),
            RelayMessage::Notice("slow down".to_string())
        );
        assert_eq!(
            RelayMessage::from_json(r#"["CLOSED","sub-1","error: shutting down"]"#).unwrap(),
            RelayMessage::Closed {
                subscription_id: SubscriptionId::new("sub-1"),
                message: "error: shutting down".to_string(),
            }
        );
        assert_eq!(
            RelayMessage::from_json(r#"["COUNT","sub-1",{"count":42}]"#).unwrap(),
            RelayMessage::Count {
                subscription_id: SubscriptionId::new("sub-1"),
                count: 42,
            }
        );
        assert_eq!(
            RelayMessage::from_json(r#"["AUTH","challenge"]"#).unwrap(),
            RelayMessage::Auth {
                challenge: "challenge".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_ok_message() {
        let event = create_test_event(&Keys::generate(), 1, vec![], "hello");
        let json = format!(r#"["OK","{}",false,"duplicate: already have it"]"#, event.id);

        assert_eq!(
            RelayMessage::from_json(&json).unwrap(),
            RelayMessage::Ok {
                event_id: event.id,
                status: false,
                message: "duplicate: already have it".to_string(),
            }
        );
    }

    #[test]
    fn test_reject_malformed_messages() {
        assert!(RelayMessage::from_json("{}").is_err());
        assert!(RelayMessage::from_json("[]").is_err());
        assert!(RelayMessage::from_json(r#"["EOSE"]"#).is_err());
        assert!(RelayMessage::from_json(r#"["EVENT","sub-1",{"id":"x"}]"#).is_err());
        assert!(RelayMessage::from_json(r#"["OK","nothex",true,""]"#).is_err());
        assert!(RelayMessage::from_json(r#"["PING"]"#).is_err());
        assert!(RelayMessage::from_json("not json").is_err());
    }
}
