use chrono::Utc;
use secrecy::SecretString;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{read_limited_bytes, BodyError, HubMode, VerifyParams, LEASE_SECONDS, MAX_RESPONSE_BYTES};
use crate::context::Context;
use crate::util::random_token;

/// Length of the random `hub.challenge` a subscriber must echo.
pub const CHALLENGE_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    Subscribed,
    Unsubscribed,
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("feed {0} no longer exists")]
    FeedNotFound(i64),

    #[error("invalid callback URL: {0}")]
    InvalidCallback(#[from] url::ParseError),

    #[error("callback request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("callback answered HTTP {0}")]
    Status(u16),

    #[error("callback did not echo the challenge")]
    ChallengeMismatch,

    #[error("callback response exceeds {MAX_RESPONSE_BYTES} bytes")]
    ResponseTooLarge,

    #[error("cancelled by shutdown")]
    Cancelled,

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl From<BodyError> for VerifyError {
    fn from(err: BodyError) -> Self {
        match err {
            BodyError::TooLarge => VerifyError::ResponseTooLarge,
            BodyError::Network(e) => VerifyError::Network(e),
        }
    }
}

/// Confirm the subscriber's intent and apply the requested change.
///
/// The callback must answer 2xx with a body equal to the challenge. Only then
/// is the subscription created, renewed, or removed; any failure leaves the
/// table untouched.
pub async fn verify(
    ctx: &Context,
    params: &VerifyParams,
    cancel: &CancellationToken,
) -> Result<VerifyOutcome, VerifyError> {
    if ctx.db.get_feed(params.feed_id).await?.is_none() {
        return Err(VerifyError::FeedNotFound(params.feed_id));
    }

    let challenge = random_token(CHALLENGE_LEN);
    let url = challenge_url(params, &challenge)?;

    let exchange = async {
        let response = ctx.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(VerifyError::Status(status.as_u16()));
        }
        Ok(read_limited_bytes(response, MAX_RESPONSE_BYTES).await?)
    };

    let body = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(VerifyError::Cancelled),
        result = exchange => result?,
    };

    if body != challenge.as_bytes() {
        return Err(VerifyError::ChallengeMismatch);
    }

    let outcome = match params.mode {
        HubMode::Subscribe => {
            let secret = params.secret.clone().map(SecretString::from);
            ctx.db
                .upsert_subscription(params.feed_id, &params.callback, secret.as_ref(), Utc::now())
                .await?;
            VerifyOutcome::Subscribed
        }
        HubMode::Unsubscribe => {
            let removed = ctx
                .db
                .delete_subscription_by_callback(params.feed_id, &params.callback)
                .await?;
            if !removed {
                tracing::debug!(
                    feed_id = params.feed_id,
                    callback = %params.callback,
                    "Unsubscribe for unknown callback"
                );
            }
            VerifyOutcome::Unsubscribed
        }
    };

    tracing::info!(
        feed_id = params.feed_id,
        callback = %params.callback,
        mode = %params.mode,
        "Subscriber verified"
    );
    Ok(outcome)
}

/// The callback URL with the hub's query parameters appended to any it
/// already carries.
fn challenge_url(params: &VerifyParams, challenge: &str) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(&params.callback)?;
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("hub.mode", params.mode.as_str())
            .append_pair("hub.topic", &params.topic)
            .append_pair("hub.challenge", challenge);
        if params.mode == HubMode::Subscribe {
            query.append_pair("hub.lease_seconds", &LEASE_SECONDS.to_string());
        }
    }
    Ok(url)
}
