//! Capabilities the race core needs from whatever drives the game client.

use async_trait::async_trait;

use crate::config::RaceConfig;
use crate::error::TransportError;

/// The irreversible part of a race and the steps around it
#[async_trait]
pub trait CommitActions: Send + Sync {
    /// Select the detected opponent so the commit targets them.
    /// `Ok(None)` when nobody could be selected.
    async fn prepare(&self, cfg: &RaceConfig) -> Result<Option<String>, TransportError>;

    /// Run the commit sequence to completion. Not cancellable once started.
    async fn commit(&self, cfg: &RaceConfig) -> Result<(), TransportError>;

    /// Best-effort cleanup after an aborted race (close open dialogs)
    async fn dismiss(&self);
}

/// Session-level operations used by the supervisor
#[async_trait]
pub trait SessionControl: Send + Sync {
    /// Enter the recovery credential and wait for the game UI
    async fn login(&self, cfg: &RaceConfig) -> Result<(), TransportError>;

    /// Whether our own actor is currently blocked (jailed)
    async fn is_blocked(&self, cfg: &RaceConfig) -> Result<bool, TransportError>;

    /// Run the release procedure for a blocked actor, then reload
    async fn release(&self, cfg: &RaceConfig) -> Result<(), TransportError>;

    /// Reload the page
    async fn reload(&self) -> Result<(), TransportError>;

    /// Full recovery: reconnect the transport, reload, log in again
    async fn recover(&self, cfg: &RaceConfig) -> Result<(), TransportError>;

    /// Ask the backend for a screenshot saved under `path`
    async fn screenshot(&self, path: &str) -> Result<(), TransportError>;
}
