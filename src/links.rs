//! Public URLs and addresses derived from the service hostname.

pub fn feed_xml(hostname: &str, feed_public_id: &str) -> String {
    format!("https://{hostname}/feeds/{feed_public_id}.xml")
}

/// The WebSub hub endpoint of a feed.
pub fn feed_hub(hostname: &str, feed_public_id: &str) -> String {
    format!("https://{hostname}/feeds/{feed_public_id}/websub")
}

/// Settings page of a feed, linked from every entry footer.
pub fn feed_settings(hostname: &str, feed_public_id: &str) -> String {
    format!("https://{hostname}/feeds/{feed_public_id}")
}

pub fn entry_html(hostname: &str, feed_public_id: &str, entry_public_id: &str) -> String {
    format!("https://{hostname}/feeds/{feed_public_id}/entries/{entry_public_id}.html")
}

pub fn enclosure(hostname: &str, enclosure_public_id: &str, name: &str) -> String {
    format!("https://{hostname}/files/{enclosure_public_id}/{name}")
}

/// Email address that delivers into a feed.
pub fn feed_email(hostname: &str, feed_public_id: &str) -> String {
    format!("{feed_public_id}@{hostname}")
}

/// Stable Atom id of a feed or entry.
pub fn urn(public_id: &str) -> String {
    format!("urn:letterbox:{public_id}")
}
