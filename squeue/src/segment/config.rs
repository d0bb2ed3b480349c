use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use crate::errors::{Result, SharedQueueError};

pub const DEFAULT_MAX_QUEUES: usize = 64;
pub const DEFAULT_QUEUE_SIZE: usize = 64 * 1024;
pub const DEFAULT_MAX_CONSUMERS: usize = 15;

/// Segment geometry and protocol timings.
///
/// `max_queues`, `queue_size` and `max_consumers` are fixed by whoever creates
/// the segment; processes attaching later read them from the segment header.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SharedQueueConfig {
    pub data_dir: String,
    pub segment_name: String,
    pub max_queues: usize,
    pub queue_size: usize,
    pub max_consumers: usize,
    pub connect_timeout_ms: u64,
    pub race_retry_limit: u32,
    pub race_retry_delay_ms: u64,
    pub overflow_memory_limit: usize,
}

impl Default for SharedQueueConfig {
    fn default() -> Self {
        SharedQueueConfig {
            data_dir: "/tmp".to_string(),
            segment_name: "squeue".to_string(),
            max_queues: DEFAULT_MAX_QUEUES,
            queue_size: DEFAULT_QUEUE_SIZE,
            max_consumers: DEFAULT_MAX_CONSUMERS,
            connect_timeout_ms: 10_000,
            race_retry_limit: 10,
            race_retry_delay_ms: 1_000,
            overflow_memory_limit: 4 * 1024 * 1024,
        }
    }
}

impl SharedQueueConfig {
    pub fn builder() -> SharedQueueConfigBuilder {
        SharedQueueConfigBuilder {
            cfg: SharedQueueConfig::default(),
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<SharedQueueConfig> {
        let cfg: SharedQueueConfig = confy::load_path(path)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// The file the segment's os id is linked through.
    pub fn link_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join(&self.segment_name)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn race_retry_delay(&self) -> Duration {
        Duration::from_millis(self.race_retry_delay_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_queues == 0 {
            return Err(SharedQueueError::InvalidConfig(
                "max_queues must be positive".to_string(),
            ));
        }
        if self.max_consumers == 0 {
            return Err(SharedQueueError::InvalidConfig(
                "max_consumers must be positive".to_string(),
            ));
        }
        if self.queue_size == 0 {
            return Err(SharedQueueError::InvalidConfig(
                "queue_size must be positive".to_string(),
            ));
        }
        if self.segment_name.is_empty() {
            return Err(SharedQueueError::InvalidConfig(
                "segment_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

pub struct SharedQueueConfigBuilder {
    cfg: SharedQueueConfig,
}

impl SharedQueueConfigBuilder {
    pub fn data_dir<S: Into<String>>(mut self, data_dir: S) -> Self {
        self.cfg.data_dir = data_dir.into();
        self
    }

    pub fn segment_name<S: Into<String>>(mut self, segment_name: S) -> Self {
        self.cfg.segment_name = segment_name.into();
        self
    }

    pub fn max_queues(mut self, max_queues: usize) -> Self {
        self.cfg.max_queues = max_queues;
        self
    }

    pub fn queue_size(mut self, queue_size: usize) -> Self {
        self.cfg.queue_size = queue_size;
        self
    }

    pub fn max_consumers(mut self, max_consumers: usize) -> Self {
        self.cfg.max_consumers = max_consumers;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.cfg.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn race_retry_limit(mut self, limit: u32) -> Self {
        self.cfg.race_retry_limit = limit;
        self
    }

    pub fn race_retry_delay(mut self, delay: Duration) -> Self {
        self.cfg.race_retry_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn overflow_memory_limit(mut self, limit: usize) -> Self {
        self.cfg.overflow_memory_limit = limit;
        self
    }

    pub fn build(self) -> Result<SharedQueueConfig> {
        self.cfg.validate()?;
        Ok(self.cfg)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn builder_overrides_defaults() -> Result<()> {
        let cfg = SharedQueueConfig::builder()
            .data_dir("/dev/shm")
            .segment_name("q")
            .max_queues(4)
            .queue_size(4096)
            .connect_timeout(Duration::from_millis(250))
            .build()?;
        assert_eq!(cfg.max_queues, 4);
        assert_eq!(cfg.queue_size, 4096);
        assert_eq!(cfg.max_consumers, DEFAULT_MAX_CONSUMERS);
        assert_eq!(cfg.connect_timeout(), Duration::from_millis(250));
        assert_eq!(cfg.link_path(), PathBuf::from("/dev/shm/q"));
        Ok(())
    }

    #[test]
    fn builder_rejects_empty_geometry() {
        let err = SharedQueueConfig::builder().max_queues(0).build().unwrap_err();
        assert!(matches!(err, SharedQueueError::InvalidConfig(_)));
        let err = SharedQueueConfig::builder().max_consumers(0).build().unwrap_err();
        assert!(matches!(err, SharedQueueError::InvalidConfig(_)));
    }

    #[test]
    fn load_fills_missing_fields_with_defaults() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("squeue.toml");
        fs::write(&path, "max_queues = 8\nqueue_size = 8192\n")?;
        let cfg = SharedQueueConfig::load(&path)?;
        assert_eq!(cfg.max_queues, 8);
        assert_eq!(cfg.queue_size, 8192);
        assert_eq!(cfg.race_retry_limit, 10);
        assert_eq!(cfg.segment_name, "squeue");
        Ok(())
    }
}
