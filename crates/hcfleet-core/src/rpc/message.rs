//! JSON-RPC 2.0 framing used by conductor interfaces.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::signal::Signal;

#[derive(Debug, Serialize)]
pub struct RpcRequest<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    pub params: &'a Value,
}

impl<'a> RpcRequest<'a> {
    pub fn new(id: u64, method: &'a str, params: &'a Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

/// `error` member of a failed response
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// Anything a conductor can push down an interface socket
#[derive(Debug)]
pub enum Inbound {
    Response {
        id: u64,
        outcome: Result<Value, RpcErrorObject>,
    },
    Signal(Signal),
    /// Valid JSON we have no use for
    Other(Value),
}

/// Decode one text frame.
pub fn decode_inbound(text: &str) -> Result<Inbound, serde_json::Error> {
    let value: Value = serde_json::from_str(text)?;

    if let Some(signal) = Signal::decode(&value) {
        return Ok(Inbound::Signal(signal));
    }

    let id = match value.get("id") {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    };
    let Some(id) = id else {
        return Ok(Inbound::Other(value));
    };

    if let Some(error) = value.get("error") {
        let error = RpcErrorObject::deserialize(error)?;
        return Ok(Inbound::Response {
            id,
            outcome: Err(error),
        });
    }
    match value.get("result") {
        Some(result) => Ok(Inbound::Response {
            id,
            outcome: Ok(result.clone()),
        }),
        None => Ok(Inbound::Other(value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_shape() {
        let params = json!({ "id": "instance-0" });
        let text = serde_json::to_string(&RpcRequest::new(4, "admin/instance/start", &params)).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["id"], 4);
        assert_eq!(value["method"], "admin/instance/start");
        assert_eq!(value["params"]["id"], "instance-0");
    }

    #[test]
    fn test_decode_responses() {
        match decode_inbound(r#"{"jsonrpc":"2.0","id":"7","result":{"success":true}}"#).unwrap() {
            Inbound::Response { id, outcome } => {
                assert_eq!(id, 7);
                assert_eq!(outcome.unwrap()["success"], true);
            }
            other => panic!("unexpected {:?}", other),
        }

        match decode_inbound(r#"{"jsonrpc":"2.0","id":8,"error":{"code":-32602,"message":"unknown instance"}}"#).unwrap() {
            Inbound::Response { id, outcome } => {
                assert_eq!(id, 8);
                assert_eq!(outcome.unwrap_err().message, "unknown instance");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_signal_and_noise() {
        let signal = r#"{"signal":{"signal_type":"Trace","action":{"action_type":"Hold"}},"instance_id":"i"}"#;
        assert!(matches!(decode_inbound(signal).unwrap(), Inbound::Signal(_)));
        assert!(matches!(decode_inbound(r#"{"hello":1}"#).unwrap(), Inbound::Other(_)));
        assert!(decode_inbound("not json").is_err());
    }
}
