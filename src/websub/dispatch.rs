use reqwest::header::{CONTENT_TYPE, LINK};
use secrecy::ExposeSecret;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::{sign, DispatchParams};
use crate::atom;
use crate::context::Context;
use crate::links;

/// Media type of a pushed single-entry document.
pub const ATOM_CONTENT_TYPE: &str = "application/atom+xml; charset=utf-8";

const SIGNATURE_HEADER: &str = "X-Hub-Signature";

/// How a subscriber answered a content distribution request. Every variant
/// counts as success for the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// 2xx
    Delivered,
    /// 410; the subscription was removed
    Gone,
    /// Any other 4xx. The hub does not retry client errors.
    Rejected(u16),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("feed {0} no longer exists")]
    FeedNotFound(i64),

    #[error("entry {0} no longer exists")]
    EntryNotFound(i64),

    #[error("subscription {0} no longer exists")]
    SubscriptionNotFound(i64),

    #[error("callback request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("callback answered HTTP {0}")]
    Status(u16),

    #[error("cancelled by shutdown")]
    Cancelled,

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Push one entry to one subscriber.
pub async fn dispatch(
    ctx: &Context,
    params: &DispatchParams,
    cancel: &CancellationToken,
) -> Result<DispatchOutcome, DispatchError> {
    let feed = ctx
        .db
        .get_feed(params.feed_id)
        .await?
        .ok_or(DispatchError::FeedNotFound(params.feed_id))?;
    // Entry and subscription must both belong to the job's feed
    let entry = ctx
        .db
        .entry_document(params.feed_entry_id)
        .await?
        .filter(|doc| doc.entry.feed_id == feed.id)
        .ok_or(DispatchError::EntryNotFound(params.feed_entry_id))?;
    let subscription = ctx
        .db
        .get_subscription(params.subscription_id)
        .await?
        .filter(|sub| sub.feed_id == feed.id)
        .ok_or(DispatchError::SubscriptionNotFound(params.subscription_id))?;

    let body = atom::encode_feed(&ctx.hostname, &feed, std::slice::from_ref(&entry))?;
    let link = format!(
        "<{}>; rel=\"self\", <{}>; rel=\"hub\"",
        links::feed_xml(&ctx.hostname, &feed.public_id),
        links::feed_hub(&ctx.hostname, &feed.public_id),
    );

    let mut request = ctx
        .http
        .post(&subscription.callback)
        .header(CONTENT_TYPE, ATOM_CONTENT_TYPE)
        .header(LINK, link);
    if let Some(secret) = &subscription.secret {
        request = request.header(SIGNATURE_HEADER, sign(secret.expose_secret(), body.as_bytes()));
    }

    let response = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
        response = request.body(body).send() => response?,
    };

    let status = response.status();
    if status.is_success() {
        tracing::info!(
            subscription_id = subscription.id,
            entry_id = entry.entry.id,
            "Entry delivered"
        );
        Ok(DispatchOutcome::Delivered)
    } else if status == reqwest::StatusCode::GONE {
        ctx.db.delete_subscription(subscription.id).await?;
        tracing::info!(
            subscription_id = subscription.id,
            callback = %subscription.callback,
            "Subscriber gone, subscription removed"
        );
        Ok(DispatchOutcome::Gone)
    } else if status.is_client_error() {
        tracing::warn!(
            subscription_id = subscription.id,
            callback = %subscription.callback,
            status = status.as_u16(),
            "Subscriber rejected entry"
        );
        Ok(DispatchOutcome::Rejected(status.as_u16()))
    } else {
        Err(DispatchError::Status(status.as_u16()))
    }
}
