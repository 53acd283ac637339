use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{Interval, MissedTickBehavior};

use crate::server::bootstrap::ServerContext;

const MIN_TICK_INTERVAL: Duration = Duration::from_millis(10);

fn create_interval(period: Duration) -> Interval {
    let mut interval = tokio::time::interval(period.max(MIN_TICK_INTERVAL));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Periodic work of the service: the status monitor, the cost tracker and the budget
/// checks each run on their own interval until `stop` is notified.
///
/// A tick that takes longer than its interval delays the next one instead of causing a burst.
pub async fn background_process(ctx: Arc<ServerContext>, stop: Arc<Notify>) {
    let mut monitor_interval = create_interval(ctx.config.monitor.poll_interval);
    let mut tracker_interval = create_interval(ctx.config.tracker.interval);
    let mut budget_interval = create_interval(ctx.config.budget.check_interval);

    loop {
        tokio::select! {
            _ = monitor_interval.tick() => {
                if let Err(error) = ctx.monitor.tick(Utc::now()).await {
                    log::error!("Status monitor tick failed: {error}");
                }
            }
            _ = tracker_interval.tick() => {
                if let Err(error) = ctx.tracker.tick(Utc::now()).await {
                    log::error!("Cost tracker tick failed: {error}");
                }
            }
            _ = budget_interval.tick() => {
                if let Err(error) = ctx.budgets.check_all(Utc::now()).await {
                    log::error!("Budget check failed: {error}");
                }
            }
            _ = stop.notified() => {
                log::debug!("Stopping background process");
                break;
            }
        }
    }
}
