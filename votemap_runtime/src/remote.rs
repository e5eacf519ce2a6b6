use thiserror::Error;

use crate::{MapLayer, VotemapUserConfig, WhitelistSnapshot};

/// Failure of a single call against the remote tool.
///
/// Messages are captured as text so outcomes can be cloned into reports and
/// compared in tests.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteCallError {
    #[error("transport failure calling {endpoint}: {message}")]
    Transport { endpoint: String, message: String },
    #[error("{endpoint} answered with HTTP {status}")]
    Status { endpoint: String, status: u16 },
    #[error("{command} rejected by remote tool: {message}")]
    Rejected { command: String, message: String },
    #[error("failed to decode {endpoint} response: {message}")]
    Decode { endpoint: String, message: String },
    #[error("call abandoned because the service is shutting down")]
    Interrupted,
}

/// Source of the currently valid layer catalog.
pub trait RemoteCatalog {
    fn current_layers(&self) -> Result<Vec<MapLayer>, RemoteCallError>;
}

/// The remote votemap whitelist.
pub trait RemoteWhitelist {
    fn get(&self) -> Result<WhitelistSnapshot, RemoteCallError>;
    fn set(&self, layer_ids: &[String]) -> Result<(), RemoteCallError>;
}

/// Forces the remote tool to regenerate its vote from the current whitelist.
pub trait RemoteVotemapState {
    fn reset(&self) -> Result<(), RemoteCallError>;
}

/// Vote settings configured on the remote tool itself.
pub trait RemoteVotemapConfig {
    fn votemap_config(&self) -> Result<VotemapUserConfig, RemoteCallError>;
}

/// Everything a swap cycle needs from the remote side.
pub trait RemoteTool:
    RemoteCatalog + RemoteWhitelist + RemoteVotemapState + RemoteVotemapConfig + Send + Sync
{
}

impl<T> RemoteTool for T where
    T: RemoteCatalog + RemoteWhitelist + RemoteVotemapState + RemoteVotemapConfig + Send + Sync
{
}
