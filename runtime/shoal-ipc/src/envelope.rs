use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::RemoteError;

/// Calling convention of a request, echoed on its response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStyle {
    /// Response carries only `error` and `result`.
    Fire,
    /// Response carries the handler's whole reply, extra fields included.
    Invoke,
}

impl CallStyle {
    pub fn as_str(self) -> &'static str {
        match self {
            CallStyle::Fire => "fire",
            CallStyle::Invoke => "invoke",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallEnvelope {
    pub style: CallStyle,
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
    /// Absent for notifications; the server never answers those.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub style: CallStyle,
    pub call_id: String,
    pub res: Reply,
}

/// Response payload: `{error?, result?, ...fields}`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Reply {
    pub fn ok(result: Value) -> Self {
        Self {
            error: None,
            result: Some(result),
            fields: Map::new(),
        }
    }

    pub fn error(error: RemoteError) -> Self {
        Self {
            error: Some(error),
            result: None,
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    /// Reduces the reply to what a fire-style caller is sent.
    pub fn into_fire(self) -> Self {
        Self {
            error: self.error,
            result: self.result,
            fields: Map::new(),
        }
    }

    pub fn into_result(self) -> Result<Value, RemoteError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Everything that travels over a channel connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum Frame {
    /// First frame a server writes on every accepted connection.
    Connect { server_id: String },
    Call(CallEnvelope),
    Response(ResponseEnvelope),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::WireCodec;
    use serde_json::json;

    #[test]
    fn notification_has_no_call_id_on_the_wire() {
        let frame = Frame::Call(CallEnvelope {
            style: CallStyle::Fire,
            method: "countRequest".into(),
            params: vec![],
            call_id: None,
        });
        let value = serde_json::to_value(&frame).expect("encode");
        assert_eq!(
            value,
            json!({"event": "call", "data": {"style": "fire", "method": "countRequest", "params": []}})
        );
    }

    #[test]
    fn invoke_reply_keeps_extra_fields() {
        let wire = json!({
            "event": "response",
            "data": {"style": "invoke", "call_id": "4", "res": {"result": 7, "worker": "w-1"}}
        });
        let frame: Frame = serde_json::from_value(wire).expect("decode");
        let Frame::Response(response) = frame else {
            panic!("expected response frame");
        };
        assert_eq!(response.call_id, "4");
        assert_eq!(response.res.fields.get("worker"), Some(&json!("w-1")));
        assert_eq!(response.res.clone().into_fire().fields.len(), 0);
        assert_eq!(response.res.into_result().expect("ok"), json!(7));
    }

    #[test]
    fn msgpack_carries_call_frames() {
        let frame = Frame::Call(CallEnvelope {
            style: CallStyle::Invoke,
            method: "execute".into(),
            params: vec![json!("SELECT 1"), json!([1, "a"])],
            call_id: Some("0".into()),
        });
        let bytes = WireCodec::Msgpack.encode(&frame).expect("encode");
        let decoded: Frame = WireCodec::Msgpack.decode(&bytes).expect("decode");
        assert_eq!(decoded, frame);
    }
}
