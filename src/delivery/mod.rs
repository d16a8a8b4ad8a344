//! Delivery of window batches to the remote store.
//!
//! A batch is written to a local checkpoint before any network traffic and
//! the checkpoint is only removed once the remote store has confirmed it.

pub mod checkpoint;
pub mod stage;
pub mod transport;

// Re-export commonly used types
pub use checkpoint::{CheckpointStore, PendingCheckpoint};
pub use stage::{Ack, DeliveryError, DeliveryStage, RetryReport};
pub use transport::{
    from_config as transport_from_config, DirectoryTransport, HttpTransport, HttpTransportConfig,
    HttpUploader, SftpTransport, SftpTransportConfig, Transport, TransportError, UploadOutcome,
};
