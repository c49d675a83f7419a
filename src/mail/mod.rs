//! Inbound email: SMTP session handling, MIME parsing and the ingestion
//! pipeline that turns a message into feed entries.

mod ingest;
mod parser;
pub mod smtp;

pub use ingest::{
    build_entry, deliver, recipient_public_id, sender_icon, validate_recipient, validate_sender,
    Delivery, IngestError, MAX_MESSAGE_BYTES,
};
pub use parser::{parse_mail, ParsedAttachment, ParsedMail};
