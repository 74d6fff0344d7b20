use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message;

/// JSON envelope carried in WebSocket data frames.
///
/// `id` is the correlation id: set on requests that expect a reply and echoed
/// back by the peer on the matching response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub payload: Value,
}

impl Envelope {
    /// Envelope without a correlation id
    pub fn new(payload: Value) -> Self {
        Self { id: None, payload }
    }

    /// Envelope tagged with a correlation id
    pub fn correlated(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Some(id.into()),
            payload,
        }
    }

    /// Encode as a text frame
    pub fn to_message(&self) -> Result<Message, serde_json::Error> {
        Ok(Message::Text(serde_json::to_string(self)?.into()))
    }

    /// Decode an inbound data frame.
    ///
    /// Text that is not an envelope becomes an uncorrelated string payload.
    /// Returns `None` for control frames and undecodable binary frames.
    pub fn from_message(message: &Message) -> Option<Self> {
        match message {
            Message::Text(text) => Some(
                serde_json::from_str::<Envelope>(text)
                    .unwrap_or_else(|_| Envelope::new(Value::String(text.to_string()))),
            ),
            Message::Binary(data) => serde_json::from_slice(data).ok(),
            _ => None,
        }
    }
}
