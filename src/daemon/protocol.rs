//! Wire format spoken over the daemon socket.
//!
//! One JSON request and one JSON response per connection, no length framing.
//! Both sides read a single fixed-size window, so the writer shrinks its
//! message until it fits: [`SearchRequest::fitted`] cuts the query,
//! [`SearchResponse::fitted`] clips record text and then drops records.

use serde::{Deserialize, Serialize};

use crate::semantic::{clip_text, EmailRecord};

/// Bytes the daemon reads from a connection
pub const REQUEST_BUFFER_SIZE: usize = 4096;

/// Bytes the client accepts back
pub const RESPONSE_BUFFER_SIZE: usize = 8192;

pub const DEFAULT_LIMIT: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    DEFAULT_LIMIT
}

impl SearchRequest {
    pub fn new(query: &str, limit: usize) -> Self {
        Self {
            query: Some(query.to_string()),
            limit,
        }
    }

    /// Request whose encoding fits the daemon's read window, cutting the
    /// query at a char boundary when it is too long.
    pub fn fitted(query: &str, limit: usize) -> Self {
        let mut request = Self::new(query, limit);
        let mut keep = query.chars().count();
        while encoded_len(&request) > REQUEST_BUFFER_SIZE && keep > 0 {
            keep = shrink(keep);
            request.query = Some(query.chars().take(keep).collect());
        }
        if keep < query.chars().count() {
            log::debug!("query cut to {} chars to fit the request window", keep);
        }
        request
    }
}

/// Next budget down, at least one less.
fn shrink(budget: usize) -> usize {
    budget.saturating_sub((budget / 4).max(1))
}

fn encoded_len<T: Serialize + ?Sized>(value: &T) -> usize {
    serde_json::to_vec(value)
        .map(|bytes| bytes.len())
        .unwrap_or(usize::MAX)
}

/// Projection of a stored record that goes over the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailContext {
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub text: String,
}

impl From<&EmailRecord> for EmailContext {
    fn from(record: &EmailRecord) -> Self {
        Self {
            date: record.date.clone(),
            sender: record.sender.clone(),
            subject: record.subject.clone(),
            text: record.text.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum SearchResponse {
    Success { emails: Vec<EmailContext> },
    Error { message: String },
}

/// Borrowed view that encodes exactly like [`SearchResponse::Success`].
#[derive(Serialize)]
struct SuccessView<'a> {
    status: &'static str,
    emails: &'a [EmailContext],
}

impl SearchResponse {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Success response whose encoding fits in `max_bytes`.
    ///
    /// Record text is clipped with a shrinking per-record budget first.
    /// Records are dropped from the tail only once text is gone and the
    /// headers alone still overflow.
    pub fn fitted(mut emails: Vec<EmailContext>, max_bytes: usize) -> Self {
        let fits = |emails: &[EmailContext]| {
            encoded_len(&SuccessView {
                status: "success",
                emails,
            }) <= max_bytes
        };

        let mut budget = emails
            .iter()
            .map(|email| email.text.chars().count())
            .max()
            .unwrap_or(0);
        while !fits(&emails) {
            if budget > 0 {
                budget = shrink(budget);
                for email in &mut emails {
                    email.text = clip_text(&email.text, budget);
                }
            } else if emails.pop().is_none() {
                break;
            }
        }

        Self::Success { emails }
    }
}
