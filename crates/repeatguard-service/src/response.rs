use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// The materialized result of the first successful call for a key.
///
/// This is what gets stored as the response entry, so that duplicate calls can be offered the
/// original answer. The payload is stored as serialized JSON next to the name of the type it
/// was produced from.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct CachedResponse {
    /// The Rust type name of the original result.
    pub type_name: String,
    /// The JSON-serialized original result.
    pub response: String,
    /// When the original call completed.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl CachedResponse {
    /// Captures the result of a call.
    pub fn capture<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            type_name: std::any::type_name::<T>().to_owned(),
            response: serde_json::to_string(value)?,
            created_at: Some(Utc::now()),
        })
    }

    /// Parses a response entry as read from the backend.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Serializes this response into the representation written to the backend.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Returns the original result as a generic JSON document.
    pub fn payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_str(&self.response)
    }

    /// Deserializes the original result.
    pub fn value<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.response)
    }

    /// Returns `true` if the original result was of type `T`.
    pub fn is<T>(&self) -> bool {
        self.type_name == std::any::type_name::<T>()
    }

    /// How long ago the original call completed.
    ///
    /// Entries written without a timestamp are treated as brand new.
    pub fn age(&self) -> Duration {
        self.created_at
            .and_then(|created_at| (Utc::now() - created_at).to_std().ok())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[derive(Debug, PartialEq, Deserialize, Serialize)]
    struct Receipt {
        status: String,
        amount: u64,
    }

    #[test]
    fn test_backend_representation() {
        let response = CachedResponse {
            type_name: "u32".into(),
            response: "42".into(),
            created_at: None,
        };
        let json = response.to_json().unwrap();
        insta::assert_snapshot!(json, @r#"{"type_name":"u32","response":"42","created_at":null}"#);

        let parsed = CachedResponse::from_json(r#"{"type_name":"u32","response":"42"}"#).unwrap();
        assert_eq!(parsed, response);
        assert_eq!(parsed.age(), Duration::ZERO);
    }

    #[test]
    fn test_capture() {
        let receipt = Receipt {
            status: "ok".into(),
            amount: 1200,
        };
        let response = CachedResponse::capture(&receipt).unwrap();

        assert!(response.is::<Receipt>());
        assert!(!response.is::<String>());
        assert_eq!(response.response, r#"{"status":"ok","amount":1200}"#);
        assert_eq!(response.value::<Receipt>().unwrap(), receipt);
        assert!(response.created_at.is_some());
        assert!(response.age() < Duration::from_secs(5));
    }

    #[test]
    fn test_capture_unsupported_shape() {
        // JSON object keys have to be strings
        let mut map = BTreeMap::new();
        map.insert(vec![1u8], "one");
        assert!(CachedResponse::capture(&map).is_err());
    }
}
