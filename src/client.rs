//! Query client for the context daemon.
//!
//! Semantic context is an optional enhancement for the caller, so
//! [`QueryClient::search`] never fails: every problem is logged and turns
//! into an empty string. [`QueryClient::try_search`] exposes the error for
//! callers that want it.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use crate::daemon::protocol::{EmailContext, SearchRequest, SearchResponse, RESPONSE_BUFFER_SIZE};
use crate::supervisor::{DaemonSupervisor, SupervisorError};

/// Separator between records in the formatted context
pub const CONTEXT_DELIMITER: &str = "\n\n---\n\n";

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("daemon unavailable: {0}")]
    Unavailable(#[from] SupervisorError),

    #[error("daemon socket not found at {0}")]
    SocketMissing(String),

    #[error("daemon request timed out")]
    Timeout,

    #[error("error communicating with daemon: {0}")]
    Io(std::io::Error),

    #[error("invalid daemon response: {0}")]
    Protocol(#[from] serde_json::Error),

    #[error("daemon error: {0}")]
    Daemon(String),
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            ErrorKind::WouldBlock | ErrorKind::TimedOut => Self::Timeout,
            _ => Self::Io(err),
        }
    }
}

pub struct QueryClient {
    supervisor: DaemonSupervisor,
    socket: PathBuf,
    timeout: Duration,
}

impl QueryClient {
    pub fn new(supervisor: DaemonSupervisor, timeout: Duration) -> Self {
        let socket = supervisor.paths().socket.clone();
        Self {
            supervisor,
            socket,
            timeout,
        }
    }

    /// Similar past messages formatted for a prompt, or an empty string when
    /// there is no context to give.
    pub fn search(&self, text: &str, limit: usize) -> String {
        match self.try_search(text, limit) {
            Ok(emails) => format_context(&emails),
            Err(ClientError::Unavailable(e)) => {
                log::warn!("Could not start daemon, proceeding without context: {}", e);
                String::new()
            }
            Err(e) => {
                log::warn!("{}", e);
                String::new()
            }
        }
    }

    pub fn try_search(&self, text: &str, limit: usize) -> Result<Vec<EmailContext>, ClientError> {
        if text.trim().is_empty() {
            return Ok(vec![]);
        }

        self.supervisor.ensure_running()?;

        let response = self.round_trip(&SearchRequest::fitted(text, limit))?;
        match response {
            SearchResponse::Success { emails } => Ok(emails),
            SearchResponse::Error { message } => Err(ClientError::Daemon(message)),
        }
    }

    /// One request, one response, all within `timeout` from connect to the
    /// last byte read.
    fn round_trip(&self, request: &SearchRequest) -> Result<SearchResponse, ClientError> {
        let payload = serde_json::to_vec(request)?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()?;

        let buf = runtime
            .block_on(async {
                tokio::time::timeout(self.timeout, self.exchange(&payload)).await
            })
            .map_err(|_| ClientError::Timeout)??;

        Ok(serde_json::from_slice(&buf)?)
    }

    async fn exchange(&self, payload: &[u8]) -> Result<Vec<u8>, ClientError> {
        let mut stream = UnixStream::connect(&self.socket)
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => {
                    ClientError::SocketMissing(self.socket.display().to_string())
                }
                _ => ClientError::from(e),
            })?;

        stream.write_all(payload).await?;
        // Best effort: tells the daemon the request is complete.
        let _ = stream.shutdown().await;

        let mut buf = Vec::with_capacity(RESPONSE_BUFFER_SIZE);
        (&mut stream)
            .take(RESPONSE_BUFFER_SIZE as u64)
            .read_to_end(&mut buf)
            .await?;
        Ok(buf)
    }
}

/// Render records as prompt-ready text, best match first.
pub fn format_context(emails: &[EmailContext]) -> String {
    emails
        .iter()
        .map(|email| {
            format!(
                "On {}, {} wrote:\nSubject: {}\nBody:\n{}",
                email.date, email.sender, email.subject, email.text
            )
        })
        .collect::<Vec<_>>()
        .join(CONTEXT_DELIMITER)
}
