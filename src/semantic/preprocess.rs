//! Mail body preprocessing.
//!
//! Bodies are cleaned before embedding so that quoted history and
//! signatures don't dominate the similarity key:
//! 1. Drop "On <date>, <person> wrote:" attribution lines
//! 2. Drop quoted lines starting with `>`
//! 3. Cut everything after the `-- ` signature separator
//! 4. Trim whitespace

use once_cell::sync::Lazy;
use regex::Regex;

/// Ellipsis suffix when content is truncated
const TRUNCATION_SUFFIX: &str = "...";

static ATTRIBUTION_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*on\b.*\bwrote:\s*$").expect("Failed to compile attribution regex")
});

/// Clean a plain-text mail body for indexing.
///
/// Returns `None` when nothing but quotes and signature remain.
pub fn clean_body(body: &str) -> Option<String> {
    let body = body.replace("\r\n", "\n");

    let kept: Vec<&str> = body
        .split('\n')
        .take_while(|line| *line != "-- ")
        .filter(|line| !line.trim_start().starts_with('>'))
        .filter(|line| !ATTRIBUTION_REGEX.is_match(line))
        .collect();

    let cleaned = kept.join("\n").trim().to_string();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

/// Clip text to at most `max_chars` characters, adding an ellipsis if clipped.
pub fn clip_text(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }

    // too short for an ellipsis, plain cut
    if max_chars <= TRUNCATION_SUFFIX.len() {
        return text.chars().take(max_chars).collect();
    }

    let keep = max_chars - TRUNCATION_SUFFIX.len();
    let clipped: String = text.chars().take(keep).collect();

    format!("{}{}", clipped, TRUNCATION_SUFFIX)
}
