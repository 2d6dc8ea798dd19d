//! Process-memory probe and backpressure throttle.

use std::sync::Mutex;
use std::time::Duration;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::time::sleep;

/// Poll interval while waiting for memory pressure to ease.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Upper bound on a single backpressure wait. Throttling must never turn
/// into a hard block: after this the task proceeds regardless.
const MAX_WAIT: Duration = Duration::from_secs(5);

/// Samples this process's resident memory.
#[derive(Debug)]
pub(crate) struct MemoryProbe {
    system: Mutex<System>,
    pid: Pid,
}

impl MemoryProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            pid: Pid::from_u32(std::process::id()),
        }
    }

    /// Current resident memory of this process in megabytes.
    pub fn usage_mb(&self) -> u64 {
        let mut system = match self.system.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        system.refresh_processes(ProcessesToUpdate::Some(&[self.pid]));
        system
            .process(self.pid)
            .map(|process| process.memory() / (1024 * 1024))
            .unwrap_or(0)
    }

    /// Throttle while resident memory exceeds `max_memory_mb`.
    ///
    /// Polls at a fixed interval up to a bounded maximum wait, then proceeds
    /// regardless of pressure.
    pub async fn wait_for_headroom(&self, max_memory_mb: u64) {
        let mut waited = Duration::ZERO;

        while waited < MAX_WAIT {
            let usage = self.usage_mb();
            if usage <= max_memory_mb {
                return;
            }

            tracing::debug!(
                "memory pressure: {}MB used, {}MB allowed, throttling",
                usage,
                max_memory_mb
            );
            sleep(POLL_INTERVAL).await;
            waited += POLL_INTERVAL;
        }

        tracing::warn!(
            "memory still above {}MB after {:?}, proceeding anyway",
            max_memory_mb,
            MAX_WAIT
        );
    }
}
