//! Configuration structures for shim-logger

use crate::pipeline::{Mode, PipelineOptions, RetryPolicy, DEFAULT_BUFFER_SIZE, DEFAULT_MAX_READ_BYTES};
use crate::{Result, ShimError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Upper bound on the cleanup grace period
pub const MAX_CLEANUP_TIME: Duration = Duration::from_secs(12);

/// Shim configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShimConfig {
    /// Container identity
    pub container: ContainerSettings,
    /// Pipeline settings
    pub pipeline: PipelineSettings,
    /// Sink send retries
    pub retry: RetryPolicy,
    /// Collector sink settings
    pub sink: SinkSettings,
}

/// Container identity attached to every record
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSettings {
    /// Container id
    pub id: String,
    /// Container name
    pub name: String,
}

/// Pipeline settings as written in the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Delivery mode
    pub mode: Mode,
    /// Ring buffer capacity, e.g. `"1m"` or `"512k"`
    pub max_buffer_size: String,
    /// Grace period before exit, e.g. `"5s"` or `"500ms"`
    pub cleanup_time: String,
    /// Framer working buffer size in bytes
    pub buffer_size: usize,
    /// Maximum bytes per pipe read
    pub max_read_bytes: usize,
    /// Routing tracer interval in seconds
    pub trace_interval_secs: u64,
}

/// Unix socket collector settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkSettings {
    /// Collector socket path
    pub socket_path: String,
    /// Connection timeout in seconds
    pub timeout_seconds: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            mode: Mode::Blocking,
            max_buffer_size: "1m".to_string(),
            cleanup_time: "5s".to_string(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_read_bytes: DEFAULT_MAX_READ_BYTES,
            trace_interval_secs: 60,
        }
    }
}

impl Default for SinkSettings {
    fn default() -> Self {
        Self {
            socket_path: "/run/shim-logger/collector.sock".to_string(),
            timeout_seconds: 5,
        }
    }
}

impl ShimConfig {
    /// Load and validate configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file without validating it, so command line overrides
    /// can be applied first
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ShimError::Config(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&content).map_err(|e| ShimError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.container.id.is_empty() {
            return Err(ShimError::Config("Container id cannot be empty".to_string()));
        }
        if self.container.name.is_empty() {
            return Err(ShimError::Config("Container name cannot be empty".to_string()));
        }
        if self.sink.socket_path.is_empty() {
            return Err(ShimError::Config("Socket path cannot be empty".to_string()));
        }

        let p = &self.pipeline;
        if parse_byte_size(&p.max_buffer_size)? == 0 {
            return Err(ShimError::Config(format!(
                "max_buffer_size must be positive, got {:?}",
                p.max_buffer_size
            )));
        }
        let cleanup = parse_duration(&p.cleanup_time)?;
        if cleanup > MAX_CLEANUP_TIME {
            return Err(ShimError::Config(format!(
                "cleanup_time {:?} exceeds the maximum of {:?}",
                p.cleanup_time, MAX_CLEANUP_TIME
            )));
        }
        if p.max_read_bytes == 0 || p.max_read_bytes >= p.buffer_size {
            return Err(ShimError::Config(format!(
                "max_read_bytes ({}) must be positive and smaller than buffer_size ({})",
                p.max_read_bytes, p.buffer_size
            )));
        }
        if p.trace_interval_secs == 0 {
            return Err(ShimError::Config("trace_interval_secs must be positive".to_string()));
        }

        let r = &self.retry;
        if r.max_attempts == 0 {
            return Err(ShimError::Config("retry.max_attempts must be at least 1".to_string()));
        }
        if r.max_delay_ms < r.initial_delay_ms {
            return Err(ShimError::Config(
                "retry.max_delay_ms cannot be smaller than retry.initial_delay_ms".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&r.jitter) {
            return Err(ShimError::Config("retry.jitter must be within 0..=1".to_string()));
        }
        if r.multiplier < 1.0 {
            return Err(ShimError::Config("retry.multiplier must be at least 1".to_string()));
        }

        Ok(())
    }

    /// Pipeline options for the core, validating first
    pub fn pipeline_options(&self) -> Result<PipelineOptions> {
        self.validate()?;
        Ok(PipelineOptions {
            mode: self.pipeline.mode,
            max_buffer_size: parse_byte_size(&self.pipeline.max_buffer_size)? as usize,
            buffer_size: self.pipeline.buffer_size,
            max_read_bytes: self.pipeline.max_read_bytes,
            retry: self.retry.clone(),
            trace_interval: Duration::from_secs(self.pipeline.trace_interval_secs),
        })
    }

    /// Cleanup grace period
    pub fn cleanup_duration(&self) -> Result<Duration> {
        parse_duration(&self.pipeline.cleanup_time)
    }
}

/// Parse a human readable size with binary units: `"1m"`, `"512KiB"`, `"2g"`, `"1024"`.
pub fn parse_byte_size(input: &str) -> Result<u64> {
    let trimmed = input.trim();
    let invalid = || ShimError::Config(format!("Invalid size: {:?}", input));

    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    let value: f64 = number.parse().map_err(|_| invalid())?;

    let lower = unit.trim().to_ascii_lowercase();
    let unit = lower.strip_suffix('b').unwrap_or(&lower);
    let unit = unit.strip_suffix('i').unwrap_or(unit);
    let multiplier: u64 = match unit {
        "" => 1,
        "k" => 1 << 10,
        "m" => 1 << 20,
        "g" => 1 << 30,
        "t" => 1 << 40,
        "p" => 1 << 50,
        _ => return Err(invalid()),
    };

    Ok((value * multiplier as f64) as u64)
}

/// Parse a duration such as `"5s"`, `"500ms"`, `"1m30s"` or `"0"`.
pub fn parse_duration(input: &str) -> Result<Duration> {
    humantime::parse_duration(input.trim())
        .map_err(|e| ShimError::Config(format!("Invalid duration {:?}: {}", input, e)))
}
