//! Panic recovery for sweep work.
//!
//! A panic while reconciling one instance must not take down the sweep task;
//! it is captured, logged, and converted to an error for that instance only.

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use crate::types::{Error, Result};

/// Execute an async operation with panic recovery.
///
/// Panics raised while creating or polling the future are converted to
/// `Error::Internal`.
pub async fn with_recovery_async<F, Fut, T>(operation: F, operation_name: &str) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let future = match std::panic::catch_unwind(AssertUnwindSafe(operation)) {
        Ok(future) => future,
        Err(payload) => return Err(recovered(operation_name, &payload)),
    };

    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(recovered(operation_name, &payload)),
    }
}

fn recovered(operation_name: &str, payload: &Box<dyn std::any::Any + Send>) -> Error {
    let panic_msg = extract_panic_message(payload);
    tracing::error!(
        "panic_recovered: operation={}, panic={}",
        operation_name,
        panic_msg
    );
    Error::internal(format!("Panic in {}: {}", operation_name, panic_msg))
}

/// Extract panic message from panic payload.
fn extract_panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic (no message)".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_recovery_async_success() {
        let result = with_recovery_async(|| async { Ok(42) }, "async_test").await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_with_recovery_async_error() {
        let result: Result<()> = with_recovery_async(
            || async { Err(Error::validation("async error".to_string())) },
            "async_test",
        )
        .await;

        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_panic_while_polling_is_recovered() {
        let result: Result<()> = with_recovery_async(
            || async {
                tokio::task::yield_now().await;
                if true {
                    panic!("sweep exploded");
                }
                Ok(())
            },
            "sweep_instance",
        )
        .await;

        let err_msg = result.unwrap_err().to_string();
        assert!(err_msg.contains("Panic in sweep_instance"));
        assert!(err_msg.contains("sweep exploded"));
    }

    #[tokio::test]
    async fn test_panic_while_creating_future_is_recovered() {
        let result: Result<()> = with_recovery_async(
            || -> std::future::Ready<Result<()>> { panic!("{}", "dynamic panic message") },
            "sweep_instance",
        )
        .await;

        let err_msg = result.unwrap_err().to_string();
        assert!(err_msg.contains("dynamic panic message"));
    }

    #[test]
    fn test_extract_panic_message_string() {
        let panic_result = std::panic::catch_unwind(|| {
            panic!("{}", "formatted message");
        });

        match panic_result {
            Err(payload) => {
                let msg = extract_panic_message(&payload);
                assert!(msg.contains("formatted message"));
            }
            Ok(_) => panic!("Expected panic"),
        }
    }
}
