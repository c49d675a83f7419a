//! WebSub hub: subscription intake, verification of intent, and content
//! distribution to subscribers.
//!
//! Intake runs inside the HTTP request and only enqueues a `verify` job.
//! The verify and dispatch workers perform the network calls.

mod dispatch;
mod intake;
mod signature;
mod verify;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use crate::storage::DispatchParams;
pub use dispatch::{dispatch, DispatchError, DispatchOutcome, ATOM_CONTENT_TYPE};
pub use intake::{intake, IntakeError, SubscriptionRequest, MAX_ACTIVE_CALLBACKS};
pub use signature::sign;
pub use verify::{verify, VerifyError, VerifyOutcome, CHALLENGE_LEN};

/// Lease granted to a verified subscriber.
pub const LEASE_SECONDS: i64 = crate::storage::SUBSCRIPTION_LEASE_SECS;

/// Upper bound on a subscriber response body we are willing to read.
const MAX_RESPONSE_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HubMode {
    Subscribe,
    Unsubscribe,
}

impl HubMode {
    pub fn as_str(self) -> &'static str {
        match self {
            HubMode::Subscribe => "subscribe",
            HubMode::Unsubscribe => "unsubscribe",
        }
    }
}

impl fmt::Display for HubMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HubMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "subscribe" => Ok(HubMode::Subscribe),
            "unsubscribe" => Ok(HubMode::Unsubscribe),
            _ => Err(()),
        }
    }
}

/// Parameters of a `verify` job, stored as JSON in `background_jobs`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyParams {
    #[serde(rename = "feedId")]
    pub feed_id: i64,
    #[serde(rename = "hub.mode")]
    pub mode: HubMode,
    #[serde(rename = "hub.topic")]
    pub topic: String,
    #[serde(rename = "hub.callback")]
    pub callback: String,
    #[serde(rename = "hub.secret", default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

impl fmt::Debug for VerifyParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerifyParams")
            .field("feed_id", &self.feed_id)
            .field("mode", &self.mode)
            .field("topic", &self.topic)
            .field("callback", &self.callback)
            .field("secret", &self.secret.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Read a subscriber response body, refusing anything over `limit` bytes.
async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, BodyError> {
    use futures::StreamExt;

    if let Some(len) = response.content_length() {
        if len as usize > limit {
            return Err(BodyError::TooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(BodyError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(BodyError::TooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}

#[derive(Debug)]
enum BodyError {
    TooLarge,
    Network(reqwest::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_verify_params_wire_names() {
        let params = VerifyParams {
            feed_id: 7,
            mode: HubMode::Subscribe,
            topic: "https://mail.example.com/feeds/abc.xml".to_string(),
            callback: "https://reader.example/cb".to_string(),
            secret: Some("hunter2".to_string()),
        };
        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(json["feedId"], 7);
        assert_eq!(json["hub.mode"], "subscribe");
        assert_eq!(json["hub.callback"], "https://reader.example/cb");
        assert_eq!(json["hub.secret"], "hunter2");

        let back: VerifyParams = serde_json::from_value(json).unwrap();
        assert_eq!(back, params);
    }

    #[test]
    fn test_verify_params_secret_is_optional() {
        let params: VerifyParams = serde_json::from_str(
            r#"{"feedId":1,"hub.mode":"unsubscribe","hub.topic":"t","hub.callback":"c"}"#,
        )
        .unwrap();
        assert_eq!(params.mode, HubMode::Unsubscribe);
        assert_eq!(params.secret, None);
    }

    #[test]
    fn test_verify_params_debug_redacts_secret() {
        let params = VerifyParams {
            feed_id: 1,
            mode: HubMode::Subscribe,
            topic: "t".to_string(),
            callback: "c".to_string(),
            secret: Some("hunter2".to_string()),
        };
        assert!(!format!("{params:?}").contains("hunter2"));
    }

    #[test]
    fn test_hub_mode_from_str() {
        assert_eq!("subscribe".parse(), Ok(HubMode::Subscribe));
        assert_eq!("unsubscribe".parse(), Ok(HubMode::Unsubscribe));
        assert_eq!("Subscribe".parse::<HubMode>(), Err(()));
        assert_eq!("".parse::<HubMode>(), Err(()));
    }
}
