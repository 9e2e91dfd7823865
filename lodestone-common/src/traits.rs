//! Collaborator capability traits.

use async_trait::async_trait;

/// The client-facing listener component. Started exactly once, after the
/// local index has caught up with the daemon for the first time.
#[async_trait]
pub trait ClientListener: Send + Sync {
    async fn start(&mut self) -> anyhow::Result<()>;
}

/// No-op listener for setups that serve nothing (tests, one-shot indexing).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoListener;

#[async_trait]
impl ClientListener for NoListener {
    async fn start(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}
