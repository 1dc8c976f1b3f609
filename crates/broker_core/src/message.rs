use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Discriminator for the four envelope kinds carried on the wire.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Request,
    Response,
    Event,
    Error,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Request => "request",
            MessageType::Response => "response",
            MessageType::Event => "event",
            MessageType::Error => "error",
        }
    }
}

/// The uniform envelope every broker participant reads and writes.
///
/// `id` is the method name for requests, echoed back on responses, and free-form for
/// events and errors. `target` names the intended recipient; absent (or empty) means
/// the broker itself. `payload` is an embedded JSON value, never a string-encoded blob.
/// At most one of `payload`/`error` is meaningful per kind.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Message {
    /// Builds a REQUEST for `method`, stamped with the current wall clock.
    pub fn request(
        method: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
        correlation_id: impl Into<String>,
        payload: Option<Value>,
    ) -> Self {
        Self {
            kind: MessageType::Request,
            id: method.into(),
            source: Some(source.into()),
            target: Some(target.into()),
            correlation_id: Some(correlation_id.into()),
            payload,
            error: None,
            timestamp: Some(Utc::now()),
        }
    }

    /// Builds the RESPONSE to `request`, echoing its method name and correlation id and
    /// addressing the requester.
    pub fn response_to(request: &Message, source: impl Into<String>, payload: Option<Value>) -> Self {
        Self {
            kind: MessageType::Response,
            id: request.id.clone(),
            source: Some(source.into()),
            target: request.source.clone(),
            correlation_id: request.correlation_id.clone(),
            payload,
            error: None,
            timestamp: Some(Utc::now()),
        }
    }

    /// Builds an EVENT. Events never carry a correlation id the sender expects a reply for.
    pub fn event(id: impl Into<String>, source: impl Into<String>, payload: Option<Value>) -> Self {
        Self {
            kind: MessageType::Event,
            id: id.into(),
            source: Some(source.into()),
            target: None,
            correlation_id: None,
            payload,
            error: None,
            timestamp: Some(Utc::now()),
        }
    }

    /// Builds an ERROR addressed to `target`, carrying the caller's correlation id so the
    /// receiver can pair it with the outstanding request.
    pub fn error_reply(
        id: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
        correlation_id: Option<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            kind: MessageType::Error,
            id: id.into(),
            source: Some(source.into()),
            target: Some(target.into()),
            correlation_id,
            payload: None,
            error: Some(error.into()),
            timestamp: Some(Utc::now()),
        }
    }

    /// True for the envelope kinds that answer an outstanding request.
    pub fn is_reply(&self) -> bool {
        matches!(self.kind, MessageType::Response | MessageType::Error)
    }

    /// The recipient id, with absent and empty both meaning "the broker".
    pub fn target_or_broker(&self) -> &str {
        match self.target.as_deref() {
            Some(t) if !t.is_empty() => t,
            _ => "",
        }
    }

    /// Decodes the payload into `T`, treating an absent payload as `null`.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone().unwrap_or(Value::Null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_field_names_match_the_contract() {
        let msg = Message::request("RPCGetProcess", "cli", "broker", "cli-1-1", Some(json!({"id": "t"})));
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "request");
        assert_eq!(value["id"], "RPCGetProcess");
        assert_eq!(value["source"], "cli");
        assert_eq!(value["target"], "broker");
        assert_eq!(value["correlation_id"], "cli-1-1");
        assert_eq!(value["payload"], json!({"id": "t"}));
        assert!(value.get("error").is_none());
    }

    #[test]
    fn absent_fields_are_omitted() {
        let msg = Message::event("process_exited", "broker", None);
        let line = serde_json::to_string(&msg).unwrap();
        assert!(!line.contains("\"target\""));
        assert!(!line.contains("\"correlation_id\""));
        assert!(!line.contains("\"payload\""));
        assert!(!line.contains("\"error\""));
    }

    #[test]
    fn response_echoes_method_and_correlation() {
        let req = Message::request("Method", "a", "b", "a-7-3", Some(json!({"x": 1})));
        let resp = Message::response_to(&req, "b", Some(json!({"y": 2})));
        assert_eq!(resp.kind, MessageType::Response);
        assert_eq!(resp.id, "Method");
        assert_eq!(resp.correlation_id.as_deref(), Some("a-7-3"));
        assert_eq!(resp.target.as_deref(), Some("a"));
    }

    #[test]
    fn empty_target_means_broker() {
        let mut msg = Message::event("e", "w", None);
        assert_eq!(msg.target_or_broker(), "");
        msg.target = Some(String::new());
        assert_eq!(msg.target_or_broker(), "");
        msg.target = Some("other".into());
        assert_eq!(msg.target_or_broker(), "other");
    }
}
