//! Polling loop for `watch`.

use std::time::Duration;

use tracing::{error, info};

use meldestelle_sync_core::SyncEngine;

use crate::signals::{is_shutdown_requested, ShutdownFlag};

/// Run sync passes every `poll_interval` until shutdown is requested.
///
/// A failed pass is logged and the loop keeps going; the next pass resumes
/// from the cursor left in storage.
pub async fn run_polling_loop(engine: &SyncEngine, poll_interval: Duration, shutdown: ShutdownFlag) {
    info!(
        interval_secs = poll_interval.as_secs(),
        "starting polling loop"
    );

    loop {
        if is_shutdown_requested(&shutdown) {
            info!("shutdown requested, exiting polling loop");
            break;
        }

        match engine.run_pass().await {
            Ok(reports) => {
                for report in reports.iter().filter(|r| r.has_changes()) {
                    info!(
                        entity = %report.entity,
                        written = report.written,
                        cursor = ?report.cursor_after.as_ref().map(|c| c.as_str()),
                        "sync pass wrote new entities"
                    );
                }
            }
            Err(e) => {
                error!(error = %e, "sync pass failed");
            }
        }

        // Sleep with early exit on shutdown
        let sleep_step = Duration::from_secs(1).min(poll_interval);
        let mut slept = Duration::ZERO;
        while slept < poll_interval {
            if is_shutdown_requested(&shutdown) {
                info!("shutdown requested during sleep, exiting");
                return;
            }
            tokio::time::sleep(sleep_step).await;
            slept += sleep_step;
        }
    }
}
