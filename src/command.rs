//! Command Validator: strict schema check of a decoded JSON object against
//! the three command templates, then conversion into a typed [`Command`].
//!
//! Grounded on `original_source/python/aiomemq.py`'s `template_subscribe`/
//! `template_unsubscribe`/`template_send` + `template_match`, generalized
//! the way the teacher dispatches on `request.get("cmd")` in
//! `handler.rs`/`async_server.rs::dispatch_request` — except here the
//! schema check must reject unknown fields, so each command is matched
//! against an explicit allowed-key set up front.

use serde::Serialize;
use serde_json::Value;

use crate::error::BrokerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Delivery {
    All,
    One,
}

#[derive(Debug, Clone)]
pub enum Command {
    Subscribe {
        topic: String,
        last_seen: Option<i64>,
        cache: Option<bool>,
    },
    Unsubscribe {
        topic: String,
    },
    Send {
        topic: String,
        msg: String,
        delivery: Delivery,
        cache: Option<bool>,
    },
}

const SUBSCRIBE_FIELDS: &[&str] = &["command", "topic", "last_seen", "cache"];
const UNSUBSCRIBE_FIELDS: &[&str] = &["command", "topic"];
const SEND_FIELDS: &[&str] = &["command", "topic", "msg", "delivery", "cache"];

/// Parse and validate a decoded JSON object into a `Command`.
///
/// Any schema violation — missing required field, wrong type, unknown
/// field, unrecognized `command`, bad `delivery` enum value — is reported
/// uniformly as `BrokerError::Malformed`.
pub fn parse_command(value: &Value) -> Result<Command, BrokerError> {
    let obj = value.as_object().ok_or(BrokerError::Malformed)?;

    let command = obj
        .get("command")
        .and_then(Value::as_str)
        .ok_or(BrokerError::Malformed)?;

    match command {
        "subscribe" => {
            reject_unknown_fields(obj, SUBSCRIBE_FIELDS)?;
            let topic = required_string(obj, "topic")?;
            let last_seen = optional_i64(obj, "last_seen")?;
            let cache = optional_bool(obj, "cache")?;
            Ok(Command::Subscribe {
                topic,
                last_seen,
                cache,
            })
        }
        "unsubscribe" => {
            reject_unknown_fields(obj, UNSUBSCRIBE_FIELDS)?;
            let topic = required_string(obj, "topic")?;
            Ok(Command::Unsubscribe { topic })
        }
        "send" => {
            reject_unknown_fields(obj, SEND_FIELDS)?;
            let topic = required_string(obj, "topic")?;
            let msg = required_string(obj, "msg")?;
            let delivery = match obj.get("delivery").and_then(Value::as_str) {
                Some("all") => Delivery::All,
                Some("one") => Delivery::One,
                _ => return Err(BrokerError::Malformed),
            };
            let cache = optional_bool(obj, "cache")?;
            Ok(Command::Send {
                topic,
                msg,
                delivery,
                cache,
            })
        }
        _ => Err(BrokerError::Malformed),
    }
}

fn reject_unknown_fields(
    obj: &serde_json::Map<String, Value>,
    allowed: &[&str],
) -> Result<(), BrokerError> {
    if obj.keys().all(|k| allowed.contains(&k.as_str())) {
        Ok(())
    } else {
        Err(BrokerError::Malformed)
    }
}

fn required_string(obj: &serde_json::Map<String, Value>, key: &str) -> Result<String, BrokerError> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(BrokerError::Malformed)
}

/// An absent key is `Ok(None)`; a present key of the wrong type is an error.
/// `serde_json`'s `as_i64` rejects booleans, unlike Python's `isinstance`.
fn optional_i64(obj: &serde_json::Map<String, Value>, key: &str) -> Result<Option<i64>, BrokerError> {
    match obj.get(key) {
        None => Ok(None),
        Some(v) => v.as_i64().map(Some).ok_or(BrokerError::Malformed),
    }
}

fn optional_bool(obj: &serde_json::Map<String, Value>, key: &str) -> Result<Option<bool>, BrokerError> {
    match obj.get(key) {
        None => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(BrokerError::Malformed),
    }
}
