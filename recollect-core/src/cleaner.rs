//! Strips structural noise from raw messages before they enter a prompt.

use regex::Regex;
use std::sync::LazyLock;

static CODE_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```.*?(?:```|\z)").expect("valid code fence pattern"));

static HTML_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"</?[A-Za-z][^<>]*>").expect("valid html tag pattern"));

static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid whitespace pattern"));

/// Header phrases that open stat blocks and similar sections.
pub const DEFAULT_NOISE_HEADERS: &[&str] = &["Status:", "Stats:", "[Status]", "Inventory:"];

/// Removes code fences, HTML tags and noise sections, then collapses
/// whitespace.
#[derive(Debug, Clone)]
pub struct TextCleaner {
    noise_headers: Vec<String>,
}

impl Default for TextCleaner {
    fn default() -> Self {
        Self::new(DEFAULT_NOISE_HEADERS.iter().map(|h| h.to_string()))
    }
}

impl TextCleaner {
    /// Create a cleaner that also drops sections opened by `noise_headers`.
    pub fn new(noise_headers: impl IntoIterator<Item = String>) -> Self {
        Self {
            noise_headers: noise_headers
                .into_iter()
                .filter(|h| !h.trim().is_empty())
                .collect(),
        }
    }

    /// Clean one message. Total: never fails, empty input gives empty output.
    pub fn clean(&self, raw: &str) -> String {
        if raw.is_empty() {
            return String::new();
        }

        let normalized = raw.replace("\r\n", "\n");
        let without_code = CODE_FENCE.replace_all(&normalized, " ");
        let mut text = HTML_TAG.replace_all(&without_code, " ").into_owned();

        for header in &self.noise_headers {
            text = strip_section(&text, header);
        }

        WHITESPACE.replace_all(&text, " ").trim().to_string()
    }
}

/// Drop every section starting at `header` up to the next paragraph break.
fn strip_section(text: &str, header: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find(header) {
        out.push_str(&rest[..start]);
        let after = &rest[start + header.len()..];
        match after.find("\n\n") {
            Some(end) => {
                out.push_str("\n\n");
                rest = &after[end + 2..];
            }
            None => {
                rest = "";
            }
        }
    }

    out.push_str(rest);
    out
}

/// Clean with the default noise headers.
pub fn clean(raw: &str) -> String {
    TextCleaner::default().clean(raw)
}
