// src/exec/bridge.rs

//! Moving work off the scheduler's event loop.

use std::any::Any;
use std::future::Future;

use anyhow::Context;

use crate::errors::TaskError;

/// Drive `fut` to completion on a fresh current-thread runtime owned by the
/// calling thread. Must be called from a thread that is not already running
/// a runtime, e.g. a `spawn_blocking` worker.
pub fn block_on<F: Future>(fut: F) -> anyhow::Result<F::Output> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building worker runtime")?;
    Ok(rt.block_on(fut))
}

/// Run a blocking closure on the blocking pool and await its result.
pub async fn run_blocking<F>(f: F) -> Result<(), TaskError>
where
    F: FnOnce() -> anyhow::Result<()> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(TaskError::call(err)),
        Err(join) if join.is_panic() => Err(TaskError::Panicked(panic_message(&*join.into_panic()))),
        Err(join) => Err(TaskError::Panicked(join.to_string())),
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn blocking_errors_become_call_errors() {
        let err = run_blocking(|| Err(anyhow::anyhow!("disk full"))).await.unwrap_err();
        assert_eq!(err.to_string(), "disk full");
    }

    #[tokio::test]
    async fn blocking_panics_are_captured() {
        let err = run_blocking(|| panic!("kaboom")).await.unwrap_err();
        assert!(matches!(err, TaskError::Panicked(msg) if msg == "kaboom"));
    }

    #[tokio::test]
    async fn private_runtime_runs_inside_blocking_pool() {
        let out = tokio::task::spawn_blocking(|| {
            block_on(async {
                tokio::task::yield_now().await;
                7
            })
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(out, 7);
    }
}
