//! Runtime configuration.

use crate::epoch::{EpochPolicy, LockAllFlush, PerOpLock};

/// How transfers bracket their RMA epochs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EpochStyle {
    /// Per-operation lock/unlock.
    #[default]
    PerOpLock,
    /// Lock-all at window creation, flush per operation.
    LockAllFlush,
}

impl EpochStyle {
    /// Instantiate the matching policy.
    pub fn policy(self) -> Box<dyn EpochPolicy> {
        match self {
            EpochStyle::PerOpLock => Box::new(PerOpLock),
            EpochStyle::LockAllFlush => Box::new(LockAllFlush),
        }
    }
}

/// How non-contiguous sections are moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StridedStrategy {
    /// Describe all element offsets at once and issue one vectored transfer.
    #[default]
    Vectored,
    /// One transfer per element.
    PerElement,
}

/// Configuration for a runtime instance.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Epoch style for all windows.
    pub epoch_style: EpochStyle,
    /// Strided transfer strategy.
    pub strided: StridedStrategy,
    /// Queue puts and complete them at the next sync instead of per call.
    /// Only meaningful together with [`EpochStyle::LockAllFlush`].
    pub deferred_puts: bool,
    /// Enable failure detection and shrink/agree recovery. Requires the
    /// transport's fault-tolerance extension.
    pub failure_handling: bool,
    /// Base microseconds of the lock-retry backoff.
    pub lock_backoff_us: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            epoch_style: EpochStyle::default(),
            strided: StridedStrategy::default(),
            deferred_puts: false,
            failure_handling: false,
            lock_backoff_us: 10,
        }
    }
}

impl RuntimeConfig {
    /// Start building a configuration.
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::default()
    }
}

/// Builder for [`RuntimeConfig`].
#[derive(Debug, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// Set the epoch style.
    pub fn epoch_style(mut self, style: EpochStyle) -> Self {
        self.config.epoch_style = style;
        self
    }

    /// Set the strided transfer strategy.
    pub fn strided(mut self, strategy: StridedStrategy) -> Self {
        self.config.strided = strategy;
        self
    }

    /// Enable deferred puts.
    pub fn deferred_puts(mut self, enable: bool) -> Self {
        self.config.deferred_puts = enable;
        self
    }

    /// Enable failure handling.
    pub fn failure_handling(mut self, enable: bool) -> Self {
        self.config.failure_handling = enable;
        self
    }

    /// Set the lock-retry backoff base.
    pub fn lock_backoff_us(mut self, us: u64) -> Self {
        self.config.lock_backoff_us = us;
        self
    }

    /// Finish building.
    pub fn build(self) -> RuntimeConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = RuntimeConfig::default();
        assert_eq!(c.epoch_style, EpochStyle::PerOpLock);
        assert_eq!(c.strided, StridedStrategy::Vectored);
        assert!(!c.deferred_puts);
        assert!(!c.failure_handling);
    }

    #[test]
    fn test_builder() {
        let c = RuntimeConfig::builder()
            .epoch_style(EpochStyle::LockAllFlush)
            .strided(StridedStrategy::PerElement)
            .deferred_puts(true)
            .failure_handling(true)
            .build();
        assert_eq!(c.epoch_style, EpochStyle::LockAllFlush);
        assert_eq!(c.strided, StridedStrategy::PerElement);
        assert!(c.deferred_puts);
        assert!(c.failure_handling);
    }
}
