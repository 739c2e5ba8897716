//! The transport boundary.
//!
//! The chat client (message sending, room membership, command parsing)
//! lives outside this crate. The engine only needs one capability from it:
//! deliver rendered text to a destination, optionally as a notice. Errors
//! are recorded by the caller and never retried — delivery is at-most-once
//! per entry per subscription.
use async_trait::async_trait;
use thiserror::Error;

/// The destination transport rejected or failed a send.
#[derive(Debug, Error)]
#[error("Dispatch to {destination} failed: {reason}")]
pub struct DispatchError {
    pub destination: String,
    pub reason: String,
}

impl DispatchError {
    pub fn new(destination: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            reason: reason.into(),
        }
    }
}

/// Delivers rendered notifications to destinations.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Deliver `text` (markdown-flavored) to `destination`.
    ///
    /// `as_notice` is the destination's notice-mode flag; what it means is
    /// up to the transport (e.g. an unhighlighted message type).
    async fn deliver(
        &self,
        destination: &str,
        text: &str,
        as_notice: bool,
    ) -> Result<(), DispatchError>;
}

/// Dispatcher that logs deliveries instead of sending them anywhere.
///
/// Used by the binary when no transport is wired up, and handy in local
/// runs to watch the engine work.
#[derive(Debug, Default, Clone)]
pub struct LogDispatcher;

#[async_trait]
impl Dispatcher for LogDispatcher {
    async fn deliver(
        &self,
        destination: &str,
        text: &str,
        as_notice: bool,
    ) -> Result<(), DispatchError> {
        tracing::info!(destination = %destination, notice = as_notice, text = %text, "deliver");
        Ok(())
    }
}
