//! JSON-array command protocol: parsing inbound frames and serialising
//! outbound ones.

use serde_json::Value;

use crate::model::{Event, Filter};

#[derive(Debug, Clone)]
pub enum ClientFrame {
    Event(Event),
    Req { sub_id: String, filters: Vec<Filter> },
    Count { sub_id: String, filter: Filter },
    Close { sub_id: String },
    NegOpen { sub_id: String, filter: Filter, initial_msg: String },
    NegMsg { sub_id: String, msg: String },
    NegClose { sub_id: String },
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed JSON: {0}")]
    Malformed(String),
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("wrong shape for {0}")]
    WrongShape(&'static str),
}

/// Parse a single inbound text frame. Malformed JSON or a non-string first
/// element yields a `Malformed` error (caller replies NOTICE, no state
/// change); a recognised-but-malshaped command yields `WrongShape`.
pub fn parse_client_frame(text: &str) -> Result<ClientFrame, CodecError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| CodecError::Malformed(e.to_string()))?;
    let arr = value
        .as_array()
        .ok_or_else(|| CodecError::Malformed("top-level value must be an array".into()))?;
    if arr.is_empty() {
        return Err(CodecError::Malformed("empty array".into()));
    }
    let cmd = arr[0]
        .as_str()
        .ok_or_else(|| CodecError::Malformed("command must be a string".into()))?;

    match cmd {
        "EVENT" => {
            let event_val = arr.get(1).ok_or(CodecError::WrongShape("EVENT"))?;
            let event: Event = serde_json::from_value(event_val.clone())
                .map_err(|e| CodecError::Malformed(e.to_string()))?;
            Ok(ClientFrame::Event(event))
        }
        "REQ" => {
            if arr.len() < 2 {
                return Err(CodecError::WrongShape("REQ"));
            }
            let sub_id = arr[1].as_str().ok_or(CodecError::WrongShape("REQ"))?.to_string();
            let mut filters = Vec::new();
            for raw in &arr[2..] {
                filters.push(Filter::from_json(raw).map_err(|e| CodecError::Malformed(e.to_string()))?);
            }
            Ok(ClientFrame::Req { sub_id, filters })
        }
        "COUNT" => {
            if arr.len() < 3 {
                return Err(CodecError::WrongShape("COUNT"));
            }
            let sub_id = arr[1].as_str().ok_or(CodecError::WrongShape("COUNT"))?.to_string();
            let filter = Filter::from_json(&arr[2]).map_err(|e| CodecError::Malformed(e.to_string()))?;
            Ok(ClientFrame::Count { sub_id, filter })
        }
        "CLOSE" => {
            let sub_id = arr.get(1).and_then(|v| v.as_str()).ok_or(CodecError::WrongShape("CLOSE"))?;
            Ok(ClientFrame::Close { sub_id: sub_id.to_string() })
        }
        "NEG-OPEN" => {
            if arr.len() < 4 {
                return Err(CodecError::WrongShape("NEG-OPEN"));
            }
            let sub_id = arr[1].as_str().ok_or(CodecError::WrongShape("NEG-OPEN"))?.to_string();
            let filter = Filter::from_json(&arr[2]).map_err(|e| CodecError::Malformed(e.to_string()))?;
            let initial_msg = arr[3].as_str().ok_or(CodecError::WrongShape("NEG-OPEN"))?.to_string();
            Ok(ClientFrame::NegOpen { sub_id, filter, initial_msg })
        }
        "NEG-MSG" => {
            if arr.len() < 3 {
                return Err(CodecError::WrongShape("NEG-MSG"));
            }
            let sub_id = arr[1].as_str().ok_or(CodecError::WrongShape("NEG-MSG"))?.to_string();
            let msg = arr[2].as_str().ok_or(CodecError::WrongShape("NEG-MSG"))?.to_string();
            Ok(ClientFrame::NegMsg { sub_id, msg })
        }
        "NEG-CLOSE" => {
            let sub_id = arr.get(1).and_then(|v| v.as_str()).ok_or(CodecError::WrongShape("NEG-CLOSE"))?;
            Ok(ClientFrame::NegClose { sub_id: sub_id.to_string() })
        }
        other => Err(CodecError::UnknownCommand(other.to_string())),
    }
}

/// Build outbound frames. Kept as free functions rather than an enum of
/// owned `Value`s to avoid cloning events twice per subscriber.
pub mod out {
    use serde_json::json;

    use crate::model::Event;

    pub fn event(sub_id: &str, event: &Event) -> String {
        json!(["EVENT", sub_id, event]).to_string()
    }

    pub fn ok(event_id: &str, accepted: bool, reason: &str) -> String {
        json!(["OK", event_id, accepted, reason]).to_string()
    }

    pub fn notice(msg: &str) -> String {
        json!(["NOTICE", msg]).to_string()
    }

    pub fn eose(sub_id: &str) -> String {
        json!(["EOSE", sub_id]).to_string()
    }

    pub fn closed(sub_id: &str, reason: &str) -> String {
        json!(["CLOSED", sub_id, reason]).to_string()
    }

    pub fn count(sub_id: &str, n: u64) -> String {
        json!(["COUNT", sub_id, {"count": n}]).to_string()
    }

    pub fn neg_msg(sub_id: &str, hex_msg: &str) -> String {
        json!(["NEG-MSG", sub_id, hex_msg]).to_string()
    }

    pub fn neg_err(sub_id: &str, reason: &str) -> String {
        json!(["NEG-ERR", sub_id, reason]).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_array() {
        assert!(matches!(parse_client_frame("[]"), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn rejects_non_string_command() {
        assert!(matches!(parse_client_frame("[1,2,3]"), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(matches!(parse_client_frame("not json"), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn parses_close() {
        let f = parse_client_frame(r#"["CLOSE","sub1"]"#).unwrap();
        assert!(matches!(f, ClientFrame::Close { sub_id } if sub_id == "sub1"));
    }

    #[test]
    fn parses_req_with_multiple_filters() {
        let f = parse_client_frame(r#"["REQ","x",{"kinds":[1]},{"kinds":[2]}]"#).unwrap();
        match f {
            ClientFrame::Req { sub_id, filters } => {
                assert_eq!(sub_id, "x");
                assert_eq!(filters.len(), 2);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn unknown_command_is_distinguished() {
        assert!(matches!(
            parse_client_frame(r#"["WAT"]"#),
            Err(CodecError::UnknownCommand(c)) if c == "WAT"
        ));
    }
}
