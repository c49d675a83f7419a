//! Atom 1.0 encoding of a feed and its entries.
//!
//! Pure: no storage or network access. The same encoder produces the full
//! feed document served at `/feeds/{id}.xml` and the single-entry documents
//! pushed to WebSub subscribers.

use anyhow::{Context, Result};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use std::io::Cursor;

use crate::links;
use crate::storage::{format_millis, EntryDocument, Feed};

const ATOM_NAMESPACE: &str = "http://www.w3.org/2005/Atom";

/// `updated` of a feed with no entries.
pub const EMPTY_FEED_UPDATED: &str = "2000-01-01T00:00:00.000Z";

/// Author name used when an entry has none.
pub const DEFAULT_AUTHOR_NAME: &str = "Letterbox";

type XmlWriter = Writer<Cursor<Vec<u8>>>;

/// Render `feed` with `entries` (newest first) as an Atom document.
pub fn encode_feed(hostname: &str, feed: &Feed, entries: &[EntryDocument]) -> Result<String> {
    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);

    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))
        .context("Failed to write XML declaration")?;

    let mut root = BytesStart::new("feed");
    root.push_attribute(("xmlns", ATOM_NAMESPACE));
    writer
        .write_event(Event::Start(root))
        .context("Failed to write feed element")?;

    text_element(&mut writer, "id", &links::urn(&feed.public_id))?;
    link(
        &mut writer,
        "self",
        &links::feed_xml(hostname, &feed.public_id),
        None,
        None,
    )?;
    link(
        &mut writer,
        "hub",
        &links::feed_hub(hostname, &feed.public_id),
        None,
        None,
    )?;

    if let Some(icon) = feed.icon.as_deref().or(feed.email_icon.as_deref()) {
        text_element(&mut writer, "icon", icon)?;
    }

    let updated = entries
        .first()
        .map(|doc| format_millis(doc.entry.created_at))
        .unwrap_or_else(|| EMPTY_FEED_UPDATED.to_string());
    text_element(&mut writer, "updated", &updated)?;
    text_element(&mut writer, "title", &feed.title)?;

    for doc in entries {
        write_entry(&mut writer, hostname, feed, doc)?;
    }

    writer
        .write_event(Event::End(BytesEnd::new("feed")))
        .context("Failed to write feed end")?;

    let result = writer.into_inner().into_inner();
    String::from_utf8(result).context("Generated Atom contains invalid UTF-8")
}

fn write_entry(
    writer: &mut XmlWriter,
    hostname: &str,
    feed: &Feed,
    doc: &EntryDocument,
) -> Result<()> {
    let entry = &doc.entry;

    writer
        .write_event(Event::Start(BytesStart::new("entry")))
        .context("Failed to write entry element")?;

    text_element(writer, "id", &links::urn(&entry.public_id))?;
    link(
        writer,
        "alternate",
        &links::entry_html(hostname, &feed.public_id, &entry.public_id),
        Some("text/html"),
        None,
    )?;
    for enclosure in &doc.enclosures {
        link(
            writer,
            "enclosure",
            &links::enclosure(hostname, &enclosure.public_id, &enclosure.name),
            Some(&enclosure.content_type),
            Some(enclosure.length),
        )?;
    }

    let timestamp = format_millis(entry.created_at);
    text_element(writer, "published", &timestamp)?;
    text_element(writer, "updated", &timestamp)?;

    let author = entry.author.as_deref().filter(|a| !a.is_empty());
    let default_email = format!("letterbox@{hostname}");
    writer
        .write_event(Event::Start(BytesStart::new("author")))
        .context("Failed to write author element")?;
    text_element(writer, "name", author.unwrap_or(DEFAULT_AUTHOR_NAME))?;
    text_element(writer, "email", author.unwrap_or(&default_email))?;
    writer
        .write_event(Event::End(BytesEnd::new("author")))
        .context("Failed to write author end")?;

    text_element(writer, "title", &entry.title)?;

    let body = format!(
        "{}<hr /><p><small><a href=\"{}\">Letterbox feed settings</a></small></p>",
        entry.content,
        links::feed_settings(hostname, &feed.public_id)
    );
    let mut content = BytesStart::new("content");
    content.push_attribute(("type", "html"));
    writer
        .write_event(Event::Start(content))
        .context("Failed to write content element")?;
    writer
        .write_event(Event::Text(BytesText::new(&body)))
        .context("Failed to write content text")?;
    writer
        .write_event(Event::End(BytesEnd::new("content")))
        .context("Failed to write content end")?;

    writer
        .write_event(Event::End(BytesEnd::new("entry")))
        .context("Failed to write entry end")?;
    Ok(())
}

fn text_element(writer: &mut XmlWriter, name: &str, text: &str) -> Result<()> {
    writer
        .write_event(Event::Start(BytesStart::new(name)))
        .with_context(|| format!("Failed to write {name} element"))?;
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .with_context(|| format!("Failed to write {name} text"))?;
    writer
        .write_event(Event::End(BytesEnd::new(name)))
        .with_context(|| format!("Failed to write {name} end"))?;
    Ok(())
}

fn link(
    writer: &mut XmlWriter,
    rel: &str,
    href: &str,
    media_type: Option<&str>,
    length: Option<i64>,
) -> Result<()> {
    let mut element = BytesStart::new("link");
    element.push_attribute(("rel", rel));
    element.push_attribute(("href", href));
    if let Some(media_type) = media_type {
        element.push_attribute(("type", media_type));
    }
    if let Some(length) = length {
        element.push_attribute(("length", length.to_string().as_str()));
    }
    writer
        .write_event(Event::Empty(element))
        .context("Failed to write link element")?;
    Ok(())
}
