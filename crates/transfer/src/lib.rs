//! Moving appearance assets between peers.
//!
//! A [`TransferDescriptor`] describes one file movement, a download from the
//! relay into the local [`ContentCache`](mirage_storage::ContentCache) or an
//! upload of a locally held file. The [`Orchestrator`] runs descriptors with
//! bounded concurrency and reports each one's progress and terminal
//! [`TransferState`].

pub mod descriptor;
pub mod error;
pub mod orchestrator;
mod progress;
pub mod relay;
pub mod state;

pub use crate::descriptor::{
    AlternateTicket, Direction, DownloadDescriptor, TransferDescriptor, TransferTicket, UploadDescriptor, Variant,
};
pub use crate::orchestrator::{Orchestrator, OrchestratorBuilder, TransferEvent, TransferHandle, TransferId};
pub use crate::progress::Progress;
pub use crate::relay::{ByteStream, FetchRequest, Relay};
pub use crate::state::{SkipReason, TransferState};
