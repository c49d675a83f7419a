use mail_parser::{MessageParser, MimeHeaders, PartType};

/// The parts of a MIME message that become a feed entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedMail {
    /// Address from the `From` header
    pub from: Option<String>,
    pub subject: Option<String>,
    /// Concatenated `text/html` body parts
    pub html_body: Option<String>,
    /// Concatenated `text/plain` body parts
    pub text_body: Option<String>,
    /// Attachments and inline parts, in message order
    pub attachments: Vec<ParsedAttachment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAttachment {
    /// Unsanitized filename from the part headers
    pub filename: Option<String>,
    pub content_type: String,
    pub content: Vec<u8>,
}

/// Parse a raw RFC 5322 message. Returns `None` if nothing can be parsed.
///
/// Only genuine HTML parts count as the HTML body: a plain-text message is
/// reported through `text_body` rather than converted.
pub fn parse_mail(raw: &[u8]) -> Option<ParsedMail> {
    let message = MessageParser::default().parse(raw)?;

    let from = message
        .from()
        .and_then(|addr| addr.first())
        .and_then(|addr| addr.address())
        .map(str::to_string);

    let html: String = message
        .html_bodies()
        .filter_map(|part| match &part.body {
            PartType::Html(html) => Some(html.as_ref()),
            _ => None,
        })
        .collect();

    let text: String = message
        .text_bodies()
        .filter_map(|part| match &part.body {
            PartType::Text(text) => Some(text.as_ref()),
            _ => None,
        })
        .collect();

    let attachments = message
        .attachments()
        .map(|part| ParsedAttachment {
            filename: part.attachment_name().map(str::to_string),
            content_type: part
                .content_type()
                .map(|ct| match ct.subtype() {
                    Some(subtype) => format!("{}/{}", ct.ctype(), subtype),
                    None => ct.ctype().to_string(),
                })
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            content: part.contents().to_vec(),
        })
        .collect();

    Some(ParsedMail {
        from,
        subject: message.subject().map(str::to_string),
        html_body: (!html.trim().is_empty()).then_some(html),
        text_body: (!text.is_empty()).then_some(text),
        attachments,
    })
}
