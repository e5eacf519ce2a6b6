//! Runtime collaborators for the votemap engine.
//!
//! This crate re-exports the data contracts from `votemap_schema` and holds the
//! pieces that talk to the outside world: the remote tool traits and their HTTP
//! implementation, plus the operator command parser used by the server binary.

pub use votemap_schema::*;

mod command_text;
mod crcon;
mod remote;

pub use command_text::{parse_command_line, CommandParseError, OperatorCommand};
pub use crcon::{ConnectionError, CrconClient, CrconConnection, DEFAULT_TIMEOUT};
pub use remote::{
    RemoteCallError, RemoteCatalog, RemoteTool, RemoteVotemapConfig, RemoteVotemapState,
    RemoteWhitelist,
};
