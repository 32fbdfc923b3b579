// src/utils/mod.rs
pub mod config;
pub mod db_connect;
pub mod env;
pub mod progress_config;

use std::future::Future;
use std::time::Duration;

use crate::error::PipelineError;

/// Resident memory of this process in MB, 0 if it cannot be read.
pub async fn get_memory_usage() -> u64 {
    use sysinfo::{get_current_pid, System};
    let Ok(pid) = get_current_pid() else {
        return 0;
    };
    let mut sys = System::new();
    sys.refresh_process(pid);
    sys.process(pid)
        .map(|p| p.memory() / (1024 * 1024))
        .unwrap_or(0)
}

/// Bounds an external call so it can never outlive the lock TTL it may run under.
pub async fn with_timeout<T, F>(operation: &str, limit: Duration, fut: F) -> anyhow::Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(PipelineError::CallTimeout {
            operation: operation.to_string(),
            timeout: limit,
        }
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_timeout_reports_call_timeout() {
        let result: anyhow::Result<()> = with_timeout("slow call", Duration::from_millis(20), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        })
        .await;

        let err = result.unwrap_err();
        match err.downcast_ref::<PipelineError>() {
            Some(PipelineError::CallTimeout { operation, .. }) => assert_eq!(operation, "slow call"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_with_timeout_passes_through_result() {
        let value = with_timeout("fast call", Duration::from_secs(1), async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }
}
