//! Configuration for recollect

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the memory system and its reflection scheduler
#[derive(Debug, Clone)]
pub struct Config {
    /// Base directory for all storage
    pub data_dir: PathBuf,

    /// Delay applied by `ReflectionRequest`s that do not set their own
    pub default_delay: Duration,

    /// Cap on concurrently running reflections (None = unbounded, jobs beyond the cap queue)
    pub max_concurrent_jobs: Option<usize>,

    /// Buffer size of the job event broadcast channel
    pub event_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("recollect");

        Self {
            data_dir,
            default_delay: Duration::ZERO,
            max_concurrent_jobs: None,
            event_capacity: 256,
        }
    }
}

impl Config {
    /// Create a new config with a custom data directory
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Limit how many reflections may run at once
    pub fn with_max_concurrent_jobs(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = Some(max.max(1));
        self
    }

    /// Set the debounce delay used when a request does not specify one
    pub fn with_default_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    /// Get the path to the SQLite database
    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("memories.db")
    }

    /// Ensure all required directories exist
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.default_delay, Duration::ZERO);
        assert!(config.max_concurrent_jobs.is_none());
        assert!(config.data_dir.ends_with("recollect"));
    }

    #[test]
    fn test_builders() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::with_data_dir(dir.path().join("nested"))
            .with_max_concurrent_jobs(0)
            .with_default_delay(Duration::from_millis(250));

        // a zero cap would deadlock every job
        assert_eq!(config.max_concurrent_jobs, Some(1));
        assert_eq!(config.default_delay, Duration::from_millis(250));
        assert_eq!(config.sqlite_path(), dir.path().join("nested").join("memories.db"));

        config.ensure_dirs().unwrap();
        assert!(config.data_dir.is_dir());
    }
}
