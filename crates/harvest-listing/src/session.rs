use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("element `{selector}` did not appear within {timeout:?}")]
    ElementTimeout { selector: String, timeout: Duration },
    #[error("interaction with `{selector}` failed: {message}")]
    Interaction { selector: String, message: String },
    #[error("navigation to {url} failed: {message}")]
    Navigation { url: String, message: String },
    #[error("rendering engine transport error: {0}")]
    Transport(String),
    #[error("rendering session launch failed: {0}")]
    Launch(String),
}

impl SessionError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, SessionError::ElementTimeout { .. })
    }
}

/// Controllable handle on one rendering engine instance.
///
/// Selectors are CSS selectors evaluated against the current browsing context.
/// Every waiting operation takes an explicit timeout; nothing blocks unbounded.
#[async_trait]
pub trait RenderingSession: Send + Sync {
    async fn navigate(&mut self, url: &str) -> Result<(), SessionError>;

    /// Wait until `selector` matches at least one element.
    async fn wait_for(&mut self, selector: &str, timeout: Duration) -> Result<(), SessionError>;

    /// Wait for `selector` to appear, then click the first match.
    async fn click(&mut self, selector: &str, timeout: Duration) -> Result<(), SessionError>;

    /// Visible text of the first match, `None` if nothing matches right now.
    async fn read_text(&mut self, selector: &str) -> Result<Option<String>, SessionError>;

    /// Attribute (or DOM property such as `outerHTML`) of the first match.
    async fn read_attribute(
        &mut self,
        selector: &str,
        name: &str,
    ) -> Result<Option<String>, SessionError>;

    /// Switch the browsing context into the frame matched by `selector`.
    async fn enter_frame(&mut self, selector: &str, timeout: Duration)
        -> Result<(), SessionError>;

    /// Tear down the engine instance. Idempotent.
    async fn close(&mut self) -> Result<(), SessionError>;
}
