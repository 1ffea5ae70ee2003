//! Chunked file upload over a mux sub-channel.

pub mod assembler;
pub mod listener;
pub mod protocol;
pub mod registry;

pub use listener::spawn_upload_listener;
pub use registry::TransferRegistry;
