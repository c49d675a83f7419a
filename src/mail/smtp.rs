//! Minimal inbound SMTP listener.
//!
//! Speaks the RFC 5321 subset needed to receive newsletters: `EHLO`/`HELO`,
//! `MAIL FROM`, `RCPT TO`, `DATA`, `RSET`, `NOOP`, `QUIT`, with `VRFY`
//! answered non-committally. No TLS and no AUTH.

use chrono::Utc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::ingest::{deliver, validate_recipient, validate_sender, IngestError, MAX_MESSAGE_BYTES};
use crate::context::Context;

/// Longest accepted command line, CRLF included.
pub const MAX_COMMAND_LINE: usize = 4096;

/// Idle time allowed between client commands.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(600);

const MAX_RECIPIENTS: usize = 100;

#[derive(Debug, Error)]
pub enum SmtpError {
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    #[error("command line exceeds {MAX_COMMAND_LINE} bytes")]
    LineTooLong,

    #[error("client timed out")]
    Timeout,

    #[error("message too large (limit {MAX_MESSAGE_BYTES} bytes)")]
    MessageTooLarge,
}

/// Accept connections until `cancel` fires. Each session runs on its own task.
pub async fn serve(listener: TcpListener, ctx: Context, cancel: CancellationToken) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!(error = %e, "SMTP accept failed");
                    continue;
                }
            },
        };

        let ctx = ctx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tracing::debug!(peer = %peer, "SMTP session opened");
            if let Err(e) = Session::new(stream, ctx, cancel).run().await {
                tracing::debug!(peer = %peer, error = %e, "SMTP session ended with error");
            }
        });
    }
    tracing::info!("SMTP listener stopped");
}

// ============================================================================
// Session
// ============================================================================

enum Line {
    Data(Vec<u8>),
    Eof,
}

pub struct Session<S> {
    stream: BufReader<S>,
    ctx: Context,
    cancel: CancellationToken,
    sender: Option<String>,
    recipients: Vec<String>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Session<S> {
    pub fn new(stream: S, ctx: Context, cancel: CancellationToken) -> Self {
        Self {
            stream: BufReader::new(stream),
            ctx,
            cancel,
            sender: None,
            recipients: Vec::new(),
        }
    }

    pub async fn run(mut self) -> Result<(), SmtpError> {
        let greeting = format!("220 {} ESMTP letterbox", self.ctx.hostname);
        self.reply(&greeting).await?;

        loop {
            let line = match self.read_command().await {
                Ok(Line::Data(line)) => line,
                Ok(Line::Eof) => return Ok(()),
                Err(SmtpError::LineTooLong) => {
                    self.reply("500 5.5.2 Line too long").await?;
                    return Err(SmtpError::LineTooLong);
                }
                Err(SmtpError::Timeout) => {
                    self.reply("421 4.4.2 Timeout, closing connection").await?;
                    return Err(SmtpError::Timeout);
                }
                Err(e) => return Err(e),
            };

            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\r', '\n']);
            let (verb, args) = match line.split_once(' ') {
                Some((verb, args)) => (verb.to_ascii_uppercase(), args.trim()),
                None => (line.to_ascii_uppercase(), ""),
            };

            match verb.as_str() {
                "EHLO" => {
                    let reply = format!(
                        "250-{}\r\n250-SIZE {}\r\n250-8BITMIME\r\n250 PIPELINING",
                        self.ctx.hostname,
                        MAX_MESSAGE_BYTES - 1
                    );
                    self.reset();
                    self.reply(&reply).await?;
                }
                "HELO" => {
                    let reply = format!("250 {}", self.ctx.hostname);
                    self.reset();
                    self.reply(&reply).await?;
                }
                "MAIL" => self.mail(args).await?,
                "RCPT" => self.rcpt(args).await?,
                "DATA" => {
                    if !self.data().await? {
                        return Err(SmtpError::MessageTooLarge);
                    }
                }
                "RSET" => {
                    self.reset();
                    self.reply("250 2.0.0 OK").await?;
                }
                "NOOP" => self.reply("250 2.0.0 OK").await?,
                "VRFY" => {
                    self.reply("252 2.5.0 Cannot VRFY user, but will accept message")
                        .await?
                }
                "AUTH" => self.reply("502 5.5.1 AUTH not supported").await?,
                "QUIT" => {
                    self.reply("221 2.0.0 Bye").await?;
                    return Ok(());
                }
                _ => self.reply("500 5.5.2 Command not recognized").await?,
            }
        }
    }

    fn reset(&mut self) {
        self.sender = None;
        self.recipients.clear();
    }

    async fn mail(&mut self, args: &str) -> Result<(), SmtpError> {
        if self.sender.is_some() {
            return self.reply("503 5.5.1 Nested MAIL command").await;
        }
        let Some(address) = path_argument(args, "FROM:") else {
            return self.reply("501 5.5.4 Syntax: MAIL FROM:<address>").await;
        };

        match validate_sender(address, self.ctx.development) {
            Ok(sender) => {
                self.sender = Some(sender);
                self.reply("250 2.1.0 OK").await
            }
            Err(e) => {
                tracing::info!(sender = %address, reason = %e, "Rejected sender");
                self.reply(&format!("550 5.7.1 {e}")).await
            }
        }
    }

    async fn rcpt(&mut self, args: &str) -> Result<(), SmtpError> {
        if self.sender.is_none() {
            return self.reply("503 5.5.1 Need MAIL before RCPT").await;
        }
        if self.recipients.len() >= MAX_RECIPIENTS {
            return self.reply("452 4.5.3 Too many recipients").await;
        }
        let Some(address) = path_argument(args, "TO:") else {
            return self.reply("501 5.5.4 Syntax: RCPT TO:<address>").await;
        };

        match validate_recipient(address, &self.ctx.hostname, self.ctx.development) {
            Ok(recipient) => {
                self.recipients.push(recipient);
                self.reply("250 2.1.5 OK").await
            }
            Err(e) => {
                tracing::info!(recipient = %address, reason = %e, "Rejected recipient");
                self.reply(&format!("550 5.1.1 {e}")).await
            }
        }
    }

    /// Returns false when the session must close.
    async fn data(&mut self) -> Result<bool, SmtpError> {
        let Some(sender) = self.sender.clone() else {
            self.reply("503 5.5.1 Need MAIL before DATA").await?;
            return Ok(true);
        };
        if self.recipients.is_empty() {
            self.reply("554 5.5.1 No valid recipients").await?;
            return Ok(true);
        }

        self.reply("354 Start mail input; end with <CRLF>.<CRLF>")
            .await?;

        let message = match self.read_message().await {
            Ok(message) => message,
            Err(SmtpError::MessageTooLarge) => {
                tracing::info!(sender = %sender, "Rejected oversized message");
                self.reply("552 5.3.4 Message too big").await?;
                return Ok(false);
            }
            Err(SmtpError::Timeout) => {
                self.reply("421 4.4.2 Timeout, closing connection").await?;
                return Err(SmtpError::Timeout);
            }
            Err(e) => return Err(e),
        };

        let recipients = std::mem::take(&mut self.recipients);
        self.sender = None;

        match deliver(&self.ctx, &sender, &recipients, &message, Utc::now()).await {
            Ok(delivery) => {
                tracing::info!(
                    sender = %sender,
                    feeds = delivery.stored.len(),
                    failed = delivery.failed,
                    "Email accepted"
                );
                self.reply("250 2.0.0 OK").await?;
            }
            Err(IngestError::Storage(e)) => {
                tracing::error!(sender = %sender, error = %e, "Email storage failed");
                self.reply("451 4.3.0 Local error in processing").await?;
            }
            Err(e) => {
                tracing::info!(sender = %sender, reason = %e, "Rejected email");
                self.reply(&format!("554 5.6.0 {e}")).await?;
            }
        }
        Ok(true)
    }

    async fn reply(&mut self, text: &str) -> Result<(), SmtpError> {
        let stream = self.stream.get_mut();
        stream.write_all(text.as_bytes()).await?;
        stream.write_all(b"\r\n").await?;
        stream.flush().await?;
        Ok(())
    }

    async fn read_command(&mut self) -> Result<Line, SmtpError> {
        let line = self.read_line(MAX_COMMAND_LINE).await?;
        match line {
            Line::Data(ref bytes) if !bytes.ends_with(b"\n") && bytes.len() >= MAX_COMMAND_LINE => {
                Err(SmtpError::LineTooLong)
            }
            other => Ok(other),
        }
    }

    /// Read a `DATA` payload up to the terminating `.` line, removing dot
    /// stuffing.
    async fn read_message(&mut self) -> Result<Vec<u8>, SmtpError> {
        let mut message = Vec::new();
        loop {
            // Room past the cap, so overflow is detectable
            let budget = MAX_MESSAGE_BYTES + 3 - message.len().min(MAX_MESSAGE_BYTES);
            let line = match self.read_line(budget).await? {
                Line::Data(line) => line,
                Line::Eof => {
                    return Err(SmtpError::Io(std::io::Error::from(
                        std::io::ErrorKind::UnexpectedEof,
                    )))
                }
            };

            if line == b".\r\n" || line == b".\n" {
                return Ok(message);
            }

            let unstuffed = line.strip_prefix(b".").unwrap_or(&line);
            message.extend_from_slice(unstuffed);
            if message.len() >= MAX_MESSAGE_BYTES {
                return Err(SmtpError::MessageTooLarge);
            }
        }
    }

    async fn read_line(&mut self, limit: usize) -> Result<Line, SmtpError> {
        let mut buf = Vec::new();
        let mut limited = (&mut self.stream).take(limit as u64);
        let read = tokio::select! {
            _ = self.cancel.cancelled() => None,
            read = tokio::time::timeout(
                COMMAND_TIMEOUT,
                limited.read_until(b'\n', &mut buf),
            ) => Some(read),
        };

        let Some(read) = read else {
            self.reply("421 4.3.2 Service shutting down").await?;
            return Ok(Line::Eof);
        };

        match read {
            Err(_) => Err(SmtpError::Timeout),
            Ok(Err(e)) => Err(SmtpError::Io(e)),
            Ok(Ok(0)) => Ok(Line::Eof),
            Ok(Ok(_)) => Ok(Line::Data(buf)),
        }
    }
}

/// Extract the address from `FROM:<addr> PARAMS` / `TO:<addr>`.
fn path_argument<'a>(args: &'a str, keyword: &str) -> Option<&'a str> {
    let head = args.get(..keyword.len())?;
    if !head.eq_ignore_ascii_case(keyword) {
        return None;
    }
    let rest = args[keyword.len()..].trim_start();

    if let Some(inner) = rest.strip_prefix('<') {
        let end = inner.find('>')?;
        return Some(inner[..end].trim());
    }
    rest.split_whitespace().next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{BlobStore, Database};
    use tokio::io::{duplex, DuplexStream};

    const HOST: &str = "mail.example.com";

    async fn test_ctx(dir: &std::path::Path) -> Context {
        let db = Database::open(":memory:").await.unwrap();
        Context::new(db, BlobStore::new(dir), HOST, false, Duration::from_secs(5)).unwrap()
    }

    struct Client {
        stream: BufReader<DuplexStream>,
    }

    impl Client {
        async fn send(&mut self, line: &str) {
            let stream = self.stream.get_mut();
            stream.write_all(line.as_bytes()).await.unwrap();
            stream.write_all(b"\r\n").await.unwrap();
        }

        /// Read one (possibly multi-line) reply and return its final line.
        async fn reply(&mut self) -> String {
            loop {
                let mut line = String::new();
                self.stream.read_line(&mut line).await.unwrap();
                if line.as_bytes().get(3) != Some(&b'-') {
                    return line.trim_end().to_string();
                }
            }
        }

        async fn command(&mut self, line: &str) -> String {
            self.send(line).await;
            self.reply().await
        }
    }

    fn start(ctx: Context) -> (Client, tokio::task::JoinHandle<Result<(), SmtpError>>) {
        let (client, server) = duplex(1 << 20);
        let handle = tokio::spawn(Session::new(server, ctx, CancellationToken::new()).run());
        (
            Client {
                stream: BufReader::new(client),
            },
            handle,
        )
    }

    #[test]
    fn test_path_argument() {
        assert_eq!(path_argument("FROM:<a@b.example>", "FROM:"), Some("a@b.example"));
        assert_eq!(
            path_argument("from: <a@b.example> SIZE=100", "FROM:"),
            Some("a@b.example")
        );
        assert_eq!(path_argument("TO:a@b.example", "TO:"), Some("a@b.example"));
        assert_eq!(path_argument("FROM:<>", "FROM:"), Some(""));
        assert_eq!(path_argument("<a@b.example>", "TO:"), None);
        assert_eq!(path_argument("TO:<unterminated", "TO:"), None);
    }

    #[tokio::test]
    async fn test_full_session_stores_entry() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path()).await;
        let feed = ctx.db.create_feed("Inbox").await.unwrap();
        let (mut client, handle) = start(ctx.clone());

        assert!(client.reply().await.starts_with("220 "));
        assert!(client.command("EHLO sender.example").await.starts_with("250 "));
        assert!(client
            .command("MAIL FROM:<writer@news.example>")
            .await
            .starts_with("250"));
        assert!(client
            .command(&format!("RCPT TO:<{}@{HOST}>", feed.public_id))
            .await
            .starts_with("250"));
        assert!(client.command("DATA").await.starts_with("354"));
        client.send("Subject: Dots").await;
        client.send("Content-Type: text/plain").await;
        client.send("").await;
        client.send("..leading dot").await;
        assert!(client.command(".").await.starts_with("250"));
        assert!(client.command("QUIT").await.starts_with("221"));
        handle.await.unwrap().unwrap();

        let docs = ctx.db.entries_with_enclosures(feed.id).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].entry.title, "Dots");
        assert!(docs[0].entry.content.contains(".leading dot"));
        assert!(!docs[0].entry.content.contains("..leading dot"));
    }

    #[tokio::test]
    async fn test_rejections() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path()).await;
        let (mut client, _handle) = start(ctx);
        client.reply().await;

        assert!(client.command("RCPT TO:<x@mail.example.com>").await.starts_with("503"));
        assert!(client.command("MAIL FROM:<bot@feedrabbit.com>").await.starts_with("550"));
        assert!(client.command("MAIL FROM:<writer@news.example>").await.starts_with("250"));
        assert!(client.command("RCPT TO:<x@elsewhere.example>").await.starts_with("550"));
        assert!(client.command("DATA").await.starts_with("554"));
        assert!(client.command("VRFY someone").await.starts_with("252"));
        assert!(client.command("AUTH PLAIN abc").await.starts_with("502"));
        assert!(client.command("NOOP").await.starts_with("250"));
        assert!(client.command("RSET").await.starts_with("250"));
        assert!(client.command("BOGUS").await.starts_with("500"));
    }

    #[tokio::test]
    async fn test_unknown_feed_rejected_at_data() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path()).await;
        let (mut client, _handle) = start(ctx);
        client.reply().await;

        client.command("MAIL FROM:<writer@news.example>").await;
        assert!(client
            .command(&format!("RCPT TO:<nosuchfeed@{HOST}>"))
            .await
            .starts_with("250"));
        client.command("DATA").await;
        client.send("Subject: lost").await;
        client.send("").await;
        client.send("body").await;
        assert!(client.command(".").await.starts_with("554"));
    }

    #[tokio::test]
    async fn test_oversized_data_closes_session() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path()).await;
        let feed = ctx.db.create_feed("Inbox").await.unwrap();
        let (mut client, handle) = start(ctx);
        client.reply().await;

        client.command("MAIL FROM:<writer@news.example>").await;
        client
            .command(&format!("RCPT TO:<{}@{HOST}>", feed.public_id))
            .await;
        client.command("DATA").await;
        // The server hangs up mid-stream, so later writes may fail
        let payload = format!("{}\r\n", "x".repeat(998)).repeat(600);
        let _ = client.stream.get_mut().write_all(payload.as_bytes()).await;
        assert!(client.reply().await.starts_with("552"));
        assert!(matches!(
            handle.await.unwrap(),
            Err(SmtpError::MessageTooLarge)
        ));
    }

    #[tokio::test]
    async fn test_data_of_exactly_cap_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path()).await;
        let feed = ctx.db.create_feed("Inbox").await.unwrap();
        let (mut client, handle) = start(ctx.clone());
        client.reply().await;

        client.command("MAIL FROM:<writer@news.example>").await;
        client
            .command(&format!("RCPT TO:<{}@{HOST}>", feed.public_id))
            .await;
        client.command("DATA").await;

        // 524 lines of 1000 bytes plus one of 288 bytes
        let mut payload = format!("{}\r\n", "x".repeat(998)).repeat(524);
        payload.push_str(&format!("{}\r\n", "x".repeat(286)));
        assert_eq!(payload.len(), MAX_MESSAGE_BYTES);
        client.stream.get_mut().write_all(payload.as_bytes()).await.unwrap();

        assert!(client.reply().await.starts_with("552"));
        assert!(matches!(
            handle.await.unwrap(),
            Err(SmtpError::MessageTooLarge)
        ));
        assert!(ctx.db.entries_with_enclosures(feed.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_long_command_line_closes_session() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path()).await;
        let (mut client, handle) = start(ctx);
        client.reply().await;

        client.send(&format!("NOOP {}", "a".repeat(MAX_COMMAND_LINE))).await;
        assert!(client.reply().await.starts_with("500"));
        assert!(matches!(handle.await.unwrap(), Err(SmtpError::LineTooLong)));
    }
}
