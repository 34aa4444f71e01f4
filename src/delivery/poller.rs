//! Pull-mode loop
//!
//! Each cycle issues one time-bounded request. The local bookmark is only
//! used for the first request and cleared right after it is issued; later
//! requests rely on the remote's restart position.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{DrainEnd, LoopContext, LoopExit};
use crate::error::Result;

/// Sleep owed after a cycle that took `elapsed`
pub fn cycle_sleep(interval: Duration, elapsed: Duration) -> Duration {
    interval.saturating_sub(elapsed)
}

pub(crate) async fn run(ctx: &mut LoopContext) -> Result<LoopExit> {
    let interval = Duration::from_millis(ctx.config.poll_interval_ms);
    let restart = ctx.config.restart;
    let mut bookmark: Option<DateTime<Utc>> = ctx.config.since;

    info!(interval_ms = ctx.config.poll_interval_ms, restart, "Polling");

    loop {
        let started = Instant::now();

        let since = bookmark.take();
        debug!(bookmark = ?since, "Issuing pull request");
        let issued = ctx.session.current()?.get_after(since, restart).await;

        let reconnected = match issued {
            Ok(_) => {
                let drained = ctx.drain().await?;
                match drained.end {
                    DrainEnd::Aborted => return Ok(LoopExit::Aborted),
                    DrainEnd::Reconnected => true,
                    DrainEnd::Complete => false,
                }
            }
            Err(e) => ctx.recover(e).await?,
        };

        if reconnected {
            continue;
        }

        let sleep = cycle_sleep(interval, started.elapsed());
        ctx.shutdown.sleep(sleep).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_sleep_subtracts_processing_time() {
        let interval = Duration::from_millis(1000);
        assert_eq!(cycle_sleep(interval, Duration::from_millis(300)), Duration::from_millis(700));
        assert_eq!(cycle_sleep(interval, Duration::from_millis(1500)), Duration::ZERO);
    }
}
