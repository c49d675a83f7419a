use rand::distr::Alphanumeric;
use rand::Rng;
use std::borrow::Cow;

const PUBLIC_ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Length of feed, entry and enclosure public ids.
pub const PUBLIC_ID_LEN: usize = 20;

/// Fallback for attachments that carry no usable filename.
pub const UNTITLED_FILENAME: &str = "untitled";

/// Random lowercase alphanumeric id, as used in feed addresses and URLs.
///
/// Lowercase-only keeps ids valid as the local part of an email address,
/// which mail servers are free to case-fold.
pub fn random_id(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| PUBLIC_ID_ALPHABET[rng.random_range(0..PUBLIC_ID_ALPHABET.len())] as char)
        .collect()
}

/// Random mixed-case alphanumeric token.
pub fn random_token(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Make an attachment filename safe to use as a path component and URL segment.
///
/// Every character outside `[A-Za-z0-9_.-]` becomes `-`. A name that is empty,
/// or consists only of dots, becomes [`UNTITLED_FILENAME`].
///
/// Returns `Cow::Borrowed` when the input is already clean.
pub fn sanitize_filename(name: &str) -> Cow<'_, str> {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed.chars().all(|c| c == '.') {
        return Cow::Borrowed(UNTITLED_FILENAME);
    }

    let is_safe = |c: char| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-');
    if trimmed.chars().all(is_safe) {
        return Cow::Borrowed(trimmed);
    }

    Cow::Owned(
        trimmed
            .chars()
            .map(|c| if is_safe(c) { c } else { '-' })
            .collect(),
    )
}

/// Wrap plain text in a `<pre>` block, escaping markup.
pub fn preformatted(text: &str) -> String {
    format!("<pre>{}</pre>", quick_xml::escape::escape(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_id_alphabet_and_length() {
        let id = random_id(PUBLIC_ID_LEN);
        assert_eq!(id.len(), PUBLIC_ID_LEN);
        assert!(id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn test_random_ids_differ() {
        assert_ne!(random_id(PUBLIC_ID_LEN), random_id(PUBLIC_ID_LEN));
    }

    #[test]
    fn test_random_token() {
        let token = random_token(32);
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_sanitize_clean_name_is_borrowed() {
        let name = sanitize_filename("report-2024_v2.pdf");
        assert!(matches!(name, Cow::Borrowed(_)));
        assert_eq!(name, "report-2024_v2.pdf");
    }

    #[test]
    fn test_sanitize_replaces_unsafe_characters() {
        assert_eq!(sanitize_filename("my report (final).pdf"), "my-report--final-.pdf");
        assert_eq!(sanitize_filename("../../etc/passwd"), "..-..-etc-passwd");
        assert_eq!(sanitize_filename("résumé.txt"), "r-sum-.txt");
    }

    #[test]
    fn test_sanitize_empty_becomes_untitled() {
        assert_eq!(sanitize_filename(""), UNTITLED_FILENAME);
        assert_eq!(sanitize_filename("   "), UNTITLED_FILENAME);
        assert_eq!(sanitize_filename(".."), UNTITLED_FILENAME);
    }

    #[test]
    fn test_preformatted_escapes_markup() {
        assert_eq!(
            preformatted("a < b & <script>"),
            "<pre>a &lt; b &amp; &lt;script&gt;</pre>"
        );
    }
}
