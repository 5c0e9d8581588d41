use std::{future::Future, io};

#[cfg(target_os = "linux")]
use monoio::IoUringDriver;
use monoio::{time::TimeDriver, LegacyDriver, Runtime, RuntimeBuilder};

use crate::config::{RuntimeConfig, RuntimeType};

#[cfg(target_os = "linux")]
const MIN_SQPOLL_IDLE_TIME: u32 = 1000;

/// A monoio runtime of whichever driver the host supports.
pub enum RuntimeWrapper {
    #[cfg(target_os = "linux")]
    IoUring(Runtime<TimeDriver<IoUringDriver>>),
    Legacy(Runtime<TimeDriver<LegacyDriver>>),
}

impl RuntimeWrapper {
    /// Builds the configured driver, falling back to the legacy one when
    /// io_uring is unavailable.
    pub fn build(config: &RuntimeConfig) -> io::Result<Self> {
        match Self::effective_type(config) {
            #[cfg(target_os = "linux")]
            RuntimeType::IoUring => {
                let builder = match config.sqpoll_idle {
                    Some(idle) => {
                        let mut uring_builder = io_uring::IoUring::builder();
                        uring_builder.setup_sqpoll(MIN_SQPOLL_IDLE_TIME.max(idle));
                        RuntimeBuilder::<IoUringDriver>::new().uring_builder(uring_builder)
                    }
                    None => RuntimeBuilder::<IoUringDriver>::new(),
                };
                let runtime = builder
                    .enable_timer()
                    .with_entries(config.entries)
                    .build()?;
                Ok(RuntimeWrapper::IoUring(runtime))
            }
            RuntimeType::Legacy => {
                let runtime = RuntimeBuilder::<LegacyDriver>::new()
                    .enable_timer()
                    .build()?;
                Ok(RuntimeWrapper::Legacy(runtime))
            }
        }
    }

    fn effective_type(_config: &RuntimeConfig) -> RuntimeType {
        #[cfg(target_os = "linux")]
        if _config.runtime_type == RuntimeType::IoUring && monoio::utils::detect_uring() {
            return RuntimeType::IoUring;
        }
        RuntimeType::Legacy
    }

    pub fn block_on<F>(&mut self, future: F) -> F::Output
    where
        F: Future,
    {
        match self {
            #[cfg(target_os = "linux")]
            RuntimeWrapper::IoUring(driver) => driver.block_on(future),
            RuntimeWrapper::Legacy(driver) => driver.block_on(future),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_runtime_runs_timers() {
        let config = RuntimeConfig {
            runtime_type: RuntimeType::Legacy,
            ..Default::default()
        };
        let mut runtime = RuntimeWrapper::build(&config).unwrap();
        assert!(matches!(runtime, RuntimeWrapper::Legacy(_)));
        let slept = runtime.block_on(async {
            monoio::time::sleep(std::time::Duration::from_millis(1)).await;
            true
        });
        assert!(slept);
    }
}
