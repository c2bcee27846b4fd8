//! Core message types shared by the framer, buffer and sinks

pub mod log_message;

pub use log_message::{LogMessage, PartialMetadata, Source};
