use bytes::Bytes;
use std::time::SystemTime;

/// Record payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Binary(Bytes),
    Text(String),
}

impl Payload {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Binary(data) => data,
            Payload::Text(text) => text.as_bytes(),
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }

    /// Text view; binary payloads are decoded lossily
    pub fn to_text(&self) -> String {
        match self {
            Payload::Binary(data) => String::from_utf8_lossy(data).into_owned(),
            Payload::Text(text) => text.clone(),
        }
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(data: Vec<u8>) -> Self {
        Payload::Binary(Bytes::from(data))
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

/// One discrete unit of received data
#[derive(Debug, Clone)]
pub struct Record {
    pub payload: Payload,
    pub topic: String,
    pub timestamp: SystemTime,
    /// Per-manager emission order, starting at 1
    pub sequence: u64,
}

impl Record {
    pub fn new(payload: Payload, topic: impl Into<String>, sequence: u64) -> Self {
        Self {
            payload,
            topic: topic.into(),
            timestamp: SystemTime::now(),
            sequence,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.payload.as_bytes()
    }
}
