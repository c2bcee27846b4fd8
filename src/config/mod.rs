//! Configuration management for shim-logger

pub mod settings;

pub use settings::{
    parse_byte_size, parse_duration, ContainerSettings, PipelineSettings, ShimConfig, SinkSettings,
    MAX_CLEANUP_TIME,
};
