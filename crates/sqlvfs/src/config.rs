use std::time::Duration;

/// Tunables shared by every file a VFS opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VfsConfig {
    /// Budget for acquiring the shared range and for the EXCLUSIVE upgrade.
    ///
    /// Default: zero (one attempt, then `Busy`).
    pub lock_timeout: Duration,

    /// Budget for the dead-man's-switch shared lock taken when a WAL index is
    /// first mapped.
    ///
    /// Default: zero.
    pub shm_lock_timeout: Duration,

    /// Ceiling both timeouts are clamped to, including values set later
    /// through the `LockTimeout` file control.
    ///
    /// Default: 10 s.
    pub max_lock_timeout: Duration,

    /// Whether files report `POWERSAFE_OVERWRITE` by default.
    pub powersafe_overwrite: bool,

    /// Whether WAL and WAL-index files survive the last connection closing.
    pub persist_wal: bool,

    /// Suffix appended to a database path to name its WAL-index file.
    pub shm_suffix: &'static str,
}

impl Default for VfsConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::ZERO,
            shm_lock_timeout: Duration::ZERO,
            max_lock_timeout: Duration::from_secs(10),
            powersafe_overwrite: true,
            persist_wal: false,
            shm_suffix: "-shm",
        }
    }
}

impl VfsConfig {
    /// Validate and clamp configuration values.
    #[must_use]
    pub fn validated(mut self) -> Self {
        self.lock_timeout = self.clamp_timeout(self.lock_timeout);
        self.shm_lock_timeout = self.clamp_timeout(self.shm_lock_timeout);
        if self.shm_suffix.is_empty() {
            self.shm_suffix = "-shm";
        }
        self
    }

    /// Clamp a requested lock timeout to `max_lock_timeout`.
    #[must_use]
    pub fn clamp_timeout(&self, timeout: Duration) -> Duration {
        timeout.min(self.max_lock_timeout)
    }

    #[must_use]
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_shm_lock_timeout(mut self, timeout: Duration) -> Self {
        self.shm_lock_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = VfsConfig::default();
        assert_eq!(config.lock_timeout, Duration::ZERO);
        assert_eq!(config.max_lock_timeout, Duration::from_secs(10));
        assert!(config.powersafe_overwrite);
        assert!(!config.persist_wal);
        assert_eq!(config.shm_suffix, "-shm");
    }

    #[test]
    fn test_validated_clamps_timeouts() {
        let config = VfsConfig {
            lock_timeout: Duration::from_secs(60),
            shm_lock_timeout: Duration::from_secs(30),
            max_lock_timeout: Duration::from_secs(5),
            shm_suffix: "",
            ..VfsConfig::default()
        }
        .validated();
        assert_eq!(config.lock_timeout, Duration::from_secs(5));
        assert_eq!(config.shm_lock_timeout, Duration::from_secs(5));
        assert_eq!(config.shm_suffix, "-shm");
    }

    #[test]
    fn test_builder_setters() {
        let config = VfsConfig::default()
            .with_lock_timeout(Duration::from_millis(50))
            .with_shm_lock_timeout(Duration::from_millis(20))
            .validated();
        assert_eq!(config.lock_timeout, Duration::from_millis(50));
        assert_eq!(config.shm_lock_timeout, Duration::from_millis(20));
    }
}
