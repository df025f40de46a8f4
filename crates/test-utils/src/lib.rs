pub mod builders;
pub mod recorder;

use std::sync::Once;
use tracing_subscriber::{fmt, EnvFilter};

pub use recorder::{CollectingReporter, ConcurrencyProbe, EventLog};

static INIT: Once = Once::new();

/// Route `coopsched` logs into the test harness's captured output.
///
/// Captured output only shows for failing tests unless run with
/// `-- --nocapture`. `RUST_LOG` overrides the default `coopsched=debug`.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("coopsched=debug"));

        // Another subscriber may already be installed by the test binary.
        let _ = fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .try_init();
    });
}

/// Run a future with a 5-second timeout.
///
/// Under paused time this bounds *virtual* time, so it also catches a run
/// that would only finish through a scheduler deadline.
pub async fn with_timeout<F, T>(f: F) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(std::time::Duration::from_secs(5), f)
        .await
        .expect("Test timed out after 5 seconds")
}
