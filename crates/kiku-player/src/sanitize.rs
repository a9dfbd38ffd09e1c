//! Stream URL cleanup and fallback candidate expansion.
//!
//! URLs reach the player from settings files and clipboard pastes and often
//! carry stray quotes, backticks, or a trailing period.

use crate::config::FallbackTable;

const QUOTE_CHARS: &[char] = &['`', '\'', '"', '\u{201C}', '\u{201D}', '\u{2018}', '\u{2019}'];
const TRAILING_JUNK: &[char] = &['.', ',', ';', '!', '?', ')', ']', '}', '\'', '"', '`'];

fn is_url_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "-._~:/?#[]@!$&()*+,;=%\\".contains(c)
}

/// Extract a clean `http(s)://` URL from `raw`.
///
/// Returns the trimmed, de-quoted input when no URL token is found.
pub fn sanitize_url(raw: &str) -> String {
    let unquoted: String = raw.chars().filter(|c| !QUOTE_CHARS.contains(c)).collect();
    let text = unquoted.trim();

    let mut url = match find_url_token(text) {
        Some(token) => token.to_string(),
        None => text.to_string(),
    };

    let lower = url.to_ascii_lowercase();
    if lower.ends_with("/mp3.") || lower.ends_with(".mp3.") {
        url.pop();
    }

    url.trim_end_matches(|c: char| TRAILING_JUNK.contains(&c) || c.is_whitespace())
        .to_string()
}

fn find_url_token(text: &str) -> Option<&str> {
    let lower = text.to_ascii_lowercase();
    let start = [lower.find("https://"), lower.find("http://")]
        .into_iter()
        .flatten()
        .min()?;
    let rest = &text[start..];
    let end = rest
        .char_indices()
        .find(|(_, c)| !is_url_char(*c))
        .map(|(i, _)| i)
        .unwrap_or(rest.len());
    Some(&rest[..end])
}

/// `true` when the URL points at an MP3 mount.
pub fn is_mp3_url(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    let path = lower.split(['?', '#']).next().unwrap_or(&lower);
    path.contains("/mp3") || path.ends_with(".mp3")
}

/// Ordered, de-duplicated list of URLs to try: primary first, then fallbacks.
pub fn candidate_urls(primary: &str, fallbacks: &FallbackTable) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let primary = sanitize_url(primary);
    let iter = std::iter::once(primary.clone())
        .chain(fallbacks.for_url(&primary).iter().map(|u| sanitize_url(u)));
    for url in iter {
        if !url.is_empty() && !out.contains(&url) {
            out.push(url);
        }
    }
    out
}
