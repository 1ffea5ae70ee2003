pub mod atomic_write;
pub mod file_log;
pub mod sos;
