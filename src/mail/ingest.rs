use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

use super::parser::{parse_mail, ParsedMail};
use crate::context::Context;
use crate::storage::{Feed, IngestOutcome, NewEnclosure, NewEntry};
use crate::util::{preformatted, sanitize_filename};

/// Message size cap, headers included. A message of exactly this many bytes
/// is already refused.
pub const MAX_MESSAGE_BYTES: usize = 512 * 1024;

/// Feed-forwarding services whose mail is refused.
const DENIED_SENDER_DOMAINS: [&str; 2] = ["@blogtrottr.com", "@feedrabbit.com"];

const UNTITLED: &str = "Untitled";
const NO_CONTENT: &str = "No content.";

static EMAIL_RE: OnceLock<Regex> = OnceLock::new();

fn email_re() -> &'static Regex {
    EMAIL_RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}$")
            .expect("email pattern is valid")
    })
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid sender address")]
    InvalidSender,

    #[error("sender domain not allowed")]
    DeniedSender,

    #[error("invalid recipient address")]
    InvalidRecipient,

    #[error("recipient domain not served here")]
    ForeignDomain,

    #[error("message too large (limit {MAX_MESSAGE_BYTES} bytes)")]
    TooLarge,

    #[error("message could not be parsed")]
    Unparseable,

    #[error("no valid recipients")]
    NoRecipients,

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

/// Result of delivering one message.
#[derive(Debug)]
pub struct Delivery {
    /// One outcome per feed that stored the entry
    pub stored: Vec<IngestOutcome>,
    /// Resolved feeds whose transaction failed
    pub failed: usize,
}

// ============================================================================
// Envelope Validation
// ============================================================================

/// Check a `MAIL FROM` address. Returns the trimmed address.
pub fn validate_sender(from: &str, development: bool) -> Result<String, IngestError> {
    let from = from.trim();
    if from.is_empty() || (!development && !email_re().is_match(from)) {
        return Err(IngestError::InvalidSender);
    }

    let lower = from.to_ascii_lowercase();
    if DENIED_SENDER_DOMAINS
        .iter()
        .any(|domain| lower.ends_with(domain))
    {
        return Err(IngestError::DeniedSender);
    }

    Ok(from.to_string())
}

/// Check a `RCPT TO` address against the served hostname.
/// Returns the lowercased address.
pub fn validate_recipient(
    to: &str,
    hostname: &str,
    development: bool,
) -> Result<String, IngestError> {
    let address = to.trim().to_ascii_lowercase();

    let (local, domain) = address
        .split_once('@')
        .ok_or(IngestError::InvalidRecipient)?;
    if local.is_empty() || domain.contains('@') {
        return Err(IngestError::InvalidRecipient);
    }
    if !domain.eq_ignore_ascii_case(hostname) {
        return Err(IngestError::ForeignDomain);
    }
    if !development && !email_re().is_match(&address) {
        return Err(IngestError::InvalidRecipient);
    }

    Ok(address)
}

/// Feed public id addressed by a validated recipient.
pub fn recipient_public_id(address: &str) -> &str {
    address.split_once('@').map_or(address, |(local, _)| local)
}

/// `https://<sender domain>/favicon.ico`, if the sender has a domain.
pub fn sender_icon(sender: &str) -> Option<String> {
    let (_, domain) = sender.rsplit_once('@')?;
    let domain = domain.trim().to_ascii_lowercase();
    (!domain.is_empty()).then(|| format!("https://{domain}/favicon.ico"))
}

// ============================================================================
// Entry Construction
// ============================================================================

/// Build the entry and its enclosures from a parsed message.
pub fn build_entry(sender: &str, mail: ParsedMail) -> (NewEntry, Vec<NewEnclosure>) {
    let title = mail
        .subject
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| UNTITLED.to_string());

    let content = match (mail.html_body, mail.text_body) {
        (Some(html), _) => html,
        (None, Some(text)) => preformatted(&text),
        (None, None) => NO_CONTENT.to_string(),
    };

    let enclosures = mail
        .attachments
        .into_iter()
        .map(|attachment| NewEnclosure {
            name: sanitize_filename(attachment.filename.as_deref().unwrap_or_default())
                .into_owned(),
            content_type: attachment.content_type,
            content: attachment.content,
        })
        .collect();

    (
        NewEntry {
            author: sender.to_string(),
            title,
            content,
        },
        enclosures,
    )
}

// ============================================================================
// Delivery
// ============================================================================

/// Store a received message into every feed it is addressed to.
///
/// `sender` and `recipients` must already have passed [`validate_sender`]
/// and [`validate_recipient`]. Recipients naming unknown feeds are dropped.
/// Each feed commits independently; the delivery fails only when no
/// recipient resolves to a feed or every resolved feed failed.
pub async fn deliver(
    ctx: &Context,
    sender: &str,
    recipients: &[String],
    raw: &[u8],
    now: DateTime<Utc>,
) -> Result<Delivery, IngestError> {
    if raw.len() >= MAX_MESSAGE_BYTES {
        return Err(IngestError::TooLarge);
    }

    let mut feeds: Vec<Feed> = Vec::new();
    for recipient in recipients {
        let public_id = recipient_public_id(recipient);
        match ctx.db.get_feed_by_public_id(public_id).await? {
            Some(feed) if !feeds.iter().any(|f| f.id == feed.id) => feeds.push(feed),
            Some(_) => {}
            None => tracing::debug!(recipient = %recipient, "Dropping recipient with no feed"),
        }
    }
    if feeds.is_empty() {
        return Err(IngestError::NoRecipients);
    }

    let mail = parse_mail(raw).ok_or(IngestError::Unparseable)?;
    let (entry, enclosures) = build_entry(sender, mail);
    let icon = sender_icon(sender);

    let mut stored = Vec::with_capacity(feeds.len());
    let mut failed = 0;
    let mut last_error = None;
    for feed in &feeds {
        match ctx
            .db
            .ingest_entry(
                feed.id,
                icon.as_deref(),
                &entry,
                &enclosures,
                &ctx.blobs,
                now,
            )
            .await
        {
            Ok(outcome) => {
                tracing::info!(
                    feed_id = feed.id,
                    entry_id = outcome.entry_id,
                    enclosures = outcome.enclosures,
                    evicted = outcome.evicted,
                    dispatched = outcome.dispatched,
                    "Stored email"
                );
                stored.push(outcome);
            }
            Err(e) => {
                tracing::warn!(feed_id = feed.id, error = %e, "Failed to store email");
                failed += 1;
                last_error = Some(e);
            }
        }
    }

    if stored.is_empty() {
        if let Some(e) = last_error {
            return Err(IngestError::Storage(e));
        }
    }

    Ok(Delivery { stored, failed })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::ParsedAttachment;
    use crate::storage::{BlobStore, Database};
    use std::time::Duration;

    const HOST: &str = "mail.example.com";

    async fn test_ctx(dir: &std::path::Path) -> Context {
        let db = Database::open(":memory:").await.unwrap();
        Context::new(db, BlobStore::new(dir), HOST, false, Duration::from_secs(5)).unwrap()
    }

    fn raw_message(subject: &str, body: &str) -> Vec<u8> {
        format!(
            "From: writer@news.example\r\nSubject: {subject}\r\nContent-Type: text/html\r\n\r\n{body}\r\n"
        )
        .into_bytes()
    }

    #[test]
    fn test_validate_sender() {
        assert_eq!(
            validate_sender(" writer@news.example ", false).unwrap(),
            "writer@news.example"
        );
        assert!(matches!(
            validate_sender("not an address", false),
            Err(IngestError::InvalidSender)
        ));
        assert!(matches!(validate_sender("", true), Err(IngestError::InvalidSender)));
        assert!(validate_sender("local-only", true).is_ok());
    }

    #[test]
    fn test_denied_senders() {
        assert!(matches!(
            validate_sender("bot@Blogtrottr.com", false),
            Err(IngestError::DeniedSender)
        ));
        assert!(matches!(
            validate_sender("x@feedrabbit.com", true),
            Err(IngestError::DeniedSender)
        ));
    }

    #[test]
    fn test_validate_recipient() {
        assert_eq!(
            validate_recipient("ABC123@Mail.Example.com", HOST, false).unwrap(),
            "abc123@mail.example.com"
        );
        assert!(matches!(
            validate_recipient("abc@elsewhere.example", HOST, false),
            Err(IngestError::ForeignDomain)
        ));
        assert!(matches!(
            validate_recipient("no-at-sign", HOST, false),
            Err(IngestError::InvalidRecipient)
        ));
        assert!(matches!(
            validate_recipient("a b@mail.example.com", HOST, false),
            Err(IngestError::InvalidRecipient)
        ));
        assert!(validate_recipient("a b@mail.example.com", HOST, true).is_ok());
    }

    #[test]
    fn test_sender_icon() {
        assert_eq!(
            sender_icon("writer@News.Example").as_deref(),
            Some("https://news.example/favicon.ico")
        );
        assert_eq!(sender_icon("nobody"), None);
    }

    #[test]
    fn test_build_entry_defaults() {
        let (entry, enclosures) = build_entry("a@b.example", ParsedMail::default());
        assert_eq!(entry.title, "Untitled");
        assert_eq!(entry.content, "No content.");
        assert_eq!(entry.author, "a@b.example");
        assert!(enclosures.is_empty());
    }

    #[test]
    fn test_build_entry_text_is_preformatted() {
        let mail = ParsedMail {
            subject: Some("  ".to_string()),
            text_body: Some("1 < 2".to_string()),
            ..Default::default()
        };
        let (entry, _) = build_entry("a@b.example", mail);
        assert_eq!(entry.title, "Untitled");
        assert_eq!(entry.content, "<pre>1 &lt; 2</pre>");
    }

    #[test]
    fn test_build_entry_sanitizes_attachment_names() {
        let mail = ParsedMail {
            html_body: Some("<p>x</p>".to_string()),
            attachments: vec![
                ParsedAttachment {
                    filename: Some("my photo.jpg".to_string()),
                    content_type: "image/jpeg".to_string(),
                    content: vec![0xff],
                },
                ParsedAttachment {
                    filename: None,
                    content_type: "image/png".to_string(),
                    content: vec![],
                },
            ],
            ..Default::default()
        };
        let (entry, enclosures) = build_entry("a@b.example", mail);
        assert_eq!(entry.content, "<p>x</p>");
        assert_eq!(enclosures[0].name, "my-photo.jpg");
        assert_eq!(enclosures[1].name, "untitled");
    }

    #[tokio::test]
    async fn test_deliver_to_known_feed() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path()).await;
        let feed = ctx.db.create_feed("Inbox").await.unwrap();
        let recipients = vec![
            format!("{}@{HOST}", feed.public_id),
            format!("unknownfeed@{HOST}"),
        ];

        let delivery = deliver(
            &ctx,
            "writer@news.example",
            &recipients,
            &raw_message("Hello", "<p>Body</p>"),
            Utc::now(),
        )
        .await
        .unwrap();
        assert_eq!(delivery.stored.len(), 1);
        assert_eq!(delivery.failed, 0);

        let docs = ctx.db.entries_with_enclosures(feed.id).await.unwrap();
        assert_eq!(docs[0].entry.title, "Hello");
        assert!(docs[0].entry.content.contains("<p>Body</p>"));
        assert_eq!(docs[0].entry.author.as_deref(), Some("writer@news.example"));

        let feed = ctx.db.get_feed(feed.id).await.unwrap().unwrap();
        assert_eq!(
            feed.email_icon.as_deref(),
            Some("https://news.example/favicon.ico")
        );
    }

    #[tokio::test]
    async fn test_deliver_without_known_feed_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path()).await;

        let result = deliver(
            &ctx,
            "writer@news.example",
            &[format!("nobody@{HOST}")],
            &raw_message("Hello", "x"),
            Utc::now(),
        )
        .await;
        assert!(matches!(result, Err(IngestError::NoRecipients)));
    }

    #[tokio::test]
    async fn test_deliver_duplicate_recipient_stores_once() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path()).await;
        let feed = ctx.db.create_feed("Inbox").await.unwrap();
        let address = format!("{}@{HOST}", feed.public_id);

        let delivery = deliver(
            &ctx,
            "writer@news.example",
            &[address.clone(), address],
            &raw_message("Once", "x"),
            Utc::now(),
        )
        .await
        .unwrap();
        assert_eq!(delivery.stored.len(), 1);
    }

    #[tokio::test]
    async fn test_deliver_oversized_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path()).await;
        for len in [MAX_MESSAGE_BYTES, MAX_MESSAGE_BYTES + 1] {
            let raw = vec![b'a'; len];
            let result = deliver(&ctx, "a@b.example", &[], &raw, Utc::now()).await;
            assert!(matches!(result, Err(IngestError::TooLarge)), "{len} bytes");
        }
    }
}
