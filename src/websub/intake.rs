use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::collections::HashSet;
use thiserror::Error;

use super::{HubMode, VerifyParams, LEASE_SECONDS};
use crate::context::Context;
use crate::links;
use crate::storage::{Feed, JobKind};
use crate::util::{validate_callback, CallbackError};

/// A feed may have at most this many distinct active callbacks before new
/// ones are turned away.
pub const MAX_ACTIVE_CALLBACKS: usize = 10;

/// Form body posted to a feed's hub endpoint. Every field is optional on the
/// wire so that missing values produce a validation error rather than a
/// deserialization failure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionRequest {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.topic")]
    pub topic: Option<String>,
    /// Legacy alias for `hub.topic`
    #[serde(rename = "hub.url")]
    pub url: Option<String>,
    #[serde(rename = "hub.callback")]
    pub callback: Option<String>,
    #[serde(rename = "hub.secret")]
    pub secret: Option<String>,
}

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("invalid mode")]
    InvalidMode,

    #[error("invalid topic")]
    InvalidTopic,

    #[error("invalid callback")]
    InvalidCallback(#[from] CallbackError),

    #[error("too many subscribers")]
    RateLimited,

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl IntakeError {
    /// True for errors caused by the request rather than by the hub.
    pub fn is_validation(&self) -> bool {
        !matches!(self, IntakeError::Storage(_))
    }
}

/// Validate a subscription request against `feed` and enqueue its
/// verification. Returns the id of the `verify` job.
pub async fn intake(
    ctx: &Context,
    feed: &Feed,
    request: SubscriptionRequest,
    now: DateTime<Utc>,
) -> Result<i64, IntakeError> {
    let mode: HubMode = request
        .mode
        .as_deref()
        .unwrap_or_default()
        .parse()
        .map_err(|()| IntakeError::InvalidMode)?;

    let topic = request
        .topic
        .filter(|t| !t.is_empty())
        .or(request.url)
        .unwrap_or_default();
    if topic != links::feed_xml(&ctx.hostname, &feed.public_id) {
        return Err(IntakeError::InvalidTopic);
    }

    let callback = request.callback.unwrap_or_default();
    validate_callback(&callback, &ctx.hostname)?;

    let secret = request.secret.filter(|s| !s.trim().is_empty());

    if mode == HubMode::Subscribe {
        let since = now - Duration::seconds(LEASE_SECONDS);
        let active = ctx.db.recent_subscriptions(feed.id, since).await?;
        let callbacks: HashSet<&str> = active.iter().map(|s| s.callback.as_str()).collect();
        if callbacks.len() > MAX_ACTIVE_CALLBACKS && !callbacks.contains(callback.as_str()) {
            tracing::info!(feed_id = feed.id, "Rejecting subscription over fan-out limit");
            return Err(IntakeError::RateLimited);
        }
    }

    let params = VerifyParams {
        feed_id: feed.id,
        mode,
        topic,
        callback,
        secret,
    };
    let json = serde_json::to_string(&params).map_err(anyhow::Error::from)?;
    let job_id = ctx.db.enqueue(JobKind::Verify, now, &json).await?;

    tracing::info!(
        feed_id = feed.id,
        job_id,
        mode = %params.mode,
        callback = %params.callback,
        "Subscription request accepted"
    );
    Ok(job_id)
}
