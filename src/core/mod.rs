pub mod config;
pub mod media;
pub mod mux;
pub mod session;
pub mod signalling;
pub mod transfer;
