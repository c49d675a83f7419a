use axum::extract::rejection::FormRejection;
use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Form, Json};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};

use super::error::HttpError;
use crate::atom;
use crate::context::Context;
use crate::links;
use crate::storage::Feed;
use crate::websub::{self, IntakeError, SubscriptionRequest, ATOM_CONTENT_TYPE};

/// Longest accepted feed title or icon URL, in characters.
pub const MAX_FIELD_CHARS: usize = 200;

/// Feed XML reads allowed per hour before answering 429.
pub const MAX_READS_PER_HOUR: i64 = 10;

/// Entry HTML is newsletter markup from strangers: no scripts, no framing.
const ENTRY_CSP: &str = "default-src 'self'; img-src *; style-src 'self' 'unsafe-inline'; \
frame-src 'none'; object-src 'none'; form-action 'self'; frame-ancestors 'none'";

#[derive(Debug, Deserialize)]
pub struct FeedForm {
    #[serde(default)]
    title: String,
    #[serde(default)]
    icon: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedSummary {
    feed_id: String,
    title: String,
    icon: Option<String>,
    email: String,
    feed: String,
}

impl FeedSummary {
    fn new(hostname: &str, feed: Feed) -> Self {
        Self {
            email: links::feed_email(hostname, &feed.public_id),
            feed: links::feed_xml(hostname, &feed.public_id),
            feed_id: feed.public_id,
            title: feed.title,
            icon: feed.icon,
        }
    }
}

fn validate_title(title: &str) -> Result<&str, HttpError> {
    let title = title.trim();
    let len = title.chars().count();
    if len == 0 || len > MAX_FIELD_CHARS {
        return Err(HttpError::bad_request("invalid title"));
    }
    Ok(title)
}

/// An empty icon clears it.
fn validate_icon(icon: Option<&str>) -> Result<Option<&str>, HttpError> {
    match icon.map(str::trim).filter(|i| !i.is_empty()) {
        Some(icon) if icon.chars().count() > MAX_FIELD_CHARS => {
            Err(HttpError::bad_request("invalid icon"))
        }
        icon => Ok(icon),
    }
}

async fn load_feed(ctx: &Context, public_id: &str) -> Result<Feed, HttpError> {
    ctx.db
        .get_feed_by_public_id(public_id)
        .await?
        .ok_or_else(HttpError::not_found)
}

pub async fn create_feed(
    State(ctx): State<Context>,
    form: Result<Form<FeedForm>, FormRejection>,
) -> Result<(StatusCode, Json<FeedSummary>), HttpError> {
    let Form(form) = form?;
    let title = validate_title(&form.title)?;
    let feed = ctx.db.create_feed(title).await?;
    tracing::info!(feed_id = feed.id, public_id = %feed.public_id, "Feed created");
    Ok((StatusCode::CREATED, Json(FeedSummary::new(&ctx.hostname, feed))))
}

/// `GET /feeds/{id}.xml` serves the Atom document; `GET /feeds/{id}` the
/// feed's settings as JSON.
pub async fn show_feed(
    State(ctx): State<Context>,
    Path(id): Path<String>,
) -> Result<Response, HttpError> {
    match id.strip_suffix(".xml") {
        Some(public_id) => feed_xml(&ctx, public_id).await,
        None => {
            let feed = load_feed(&ctx, &id).await?;
            Ok(Json(FeedSummary::new(&ctx.hostname, feed)).into_response())
        }
    }
}

async fn feed_xml(ctx: &Context, public_id: &str) -> Result<Response, HttpError> {
    let feed = load_feed(ctx, public_id).await?;
    let robots = [(header::HeaderName::from_static("x-robots-tag"), "none")];

    let now = Utc::now();
    let reads = ctx
        .db
        .count_recent_visualizations(feed.id, now - Duration::hours(1))
        .await?;
    if reads > MAX_READS_PER_HOUR {
        tracing::debug!(feed_id = feed.id, reads, "Feed read rate limited");
        return Ok((StatusCode::TOO_MANY_REQUESTS, robots, "rate limited").into_response());
    }
    ctx.db.record_visualization(feed.id, now).await?;

    let entries = ctx.db.entries_with_enclosures(feed.id).await?;
    let xml = atom::encode_feed(&ctx.hostname, &feed, &entries)?;
    Ok((
        robots,
        [(header::CONTENT_TYPE, ATOM_CONTENT_TYPE)],
        xml,
    )
        .into_response())
}

pub async fn update_feed(
    State(ctx): State<Context>,
    Path(id): Path<String>,
    form: Result<Form<FeedForm>, FormRejection>,
) -> Result<StatusCode, HttpError> {
    let feed = load_feed(&ctx, &id).await?;
    let Form(form) = form?;
    let title = validate_title(&form.title)?;
    let icon = validate_icon(form.icon.as_deref())?;

    if !ctx.db.update_feed(feed.id, title, icon).await? {
        return Err(HttpError::not_found());
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_feed(
    State(ctx): State<Context>,
    Path(id): Path<String>,
) -> Result<StatusCode, HttpError> {
    let feed = load_feed(&ctx, &id).await?;
    ctx.db.delete_feed(feed.id).await?;
    tracing::info!(feed_id = feed.id, "Feed deleted");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn entry_html(
    State(ctx): State<Context>,
    Path((feed_id, entry_id)): Path<(String, String)>,
) -> Result<Response, HttpError> {
    let entry_id = entry_id
        .strip_suffix(".html")
        .ok_or_else(HttpError::not_found)?;
    let feed = load_feed(&ctx, &feed_id).await?;
    let entry = ctx
        .db
        .entry_by_public_id(feed.id, entry_id)
        .await?
        .ok_or_else(HttpError::not_found)?;

    let mut response = entry.content.into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static(ENTRY_CSP),
    );
    headers.insert(
        header::HeaderName::from_static("cross-origin-embedder-policy"),
        HeaderValue::from_static("unsafe-none"),
    );
    Ok(response)
}

pub async fn websub_hub(
    State(ctx): State<Context>,
    Path(id): Path<String>,
    request: Result<Form<SubscriptionRequest>, FormRejection>,
) -> Result<StatusCode, HttpError> {
    let feed = load_feed(&ctx, &id).await?;
    let Form(request) = request?;
    match websub::intake(&ctx, &feed, request, Utc::now()).await {
        Ok(_) => Ok(StatusCode::ACCEPTED),
        Err(IntakeError::Storage(e)) => Err(e.into()),
        Err(e) => {
            tracing::debug!(feed_id = feed.id, error = %e, "Subscription request rejected");
            Err(HttpError::bad_request(e.to_string()))
        }
    }
}

pub async fn enclosure(
    State(ctx): State<Context>,
    Path((public_id, name)): Path<(String, String)>,
) -> Result<Response, HttpError> {
    let enclosure = ctx
        .db
        .enclosure_by_public_id(&public_id)
        .await?
        .filter(|e| e.name == name)
        .ok_or_else(HttpError::not_found)?;

    let bytes = match ctx.blobs.read(&enclosure.public_id, &enclosure.name).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(enclosure_id = enclosure.id, error = %e, "Enclosure blob unreadable");
            return Err(HttpError::not_found());
        }
    };

    let content_type = HeaderValue::from_str(&enclosure.content_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    Ok(([(header::CONTENT_TYPE, content_type)], bytes).into_response())
}
