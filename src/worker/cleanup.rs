use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::time::Duration as StdDuration;
use tokio_util::sync::CancellationToken;

use crate::context::Context;
use crate::storage::SUBSCRIPTION_LEASE_SECS;

/// Feed reads older than this no longer count toward the rate limit.
pub const VISUALIZATION_RETENTION_SECS: i64 = 60 * 60;

/// Rows removed by one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub visualizations: u64,
    pub subscriptions: u64,
    pub enclosures: u64,
}

/// Delete expired visualizations and subscriptions, then every enclosure no
/// entry links to, together with its blob directory.
///
/// Safe to run repeatedly: a second sweep at the same `now` removes nothing.
pub async fn sweep(ctx: &Context, now: DateTime<Utc>) -> Result<SweepReport> {
    let visualizations = ctx
        .db
        .delete_visualizations_before(now - Duration::seconds(VISUALIZATION_RETENTION_SECS))
        .await?;
    let subscriptions = ctx
        .db
        .delete_subscriptions_before(now - Duration::seconds(SUBSCRIPTION_LEASE_SECS))
        .await?;

    let mut enclosures = 0;
    for orphan in ctx.db.orphan_enclosures().await? {
        // Blob first: if removal fails the row survives and the next sweep retries
        if let Err(e) = ctx.blobs.remove(&orphan.public_id).await {
            tracing::warn!(enclosure_id = orphan.id, error = %e, "Failed to remove enclosure blob");
            continue;
        }
        if ctx.db.delete_enclosure(orphan.id).await? {
            enclosures += 1;
        }
    }

    Ok(SweepReport {
        visualizations,
        subscriptions,
        enclosures,
    })
}

/// Sweep every `interval` until cancelled.
pub async fn run(ctx: Context, interval: StdDuration, cancel: CancellationToken) {
    // tokio::time::interval panics on a zero period
    let mut ticker = tokio::time::interval(interval.max(StdDuration::from_millis(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match sweep(&ctx, Utc::now()).await {
            Ok(report) => tracing::debug!(
                visualizations = report.visualizations,
                subscriptions = report.subscriptions,
                enclosures = report.enclosures,
                "Cleanup sweep finished"
            ),
            Err(e) => tracing::warn!(error = %e, "Cleanup sweep failed"),
        }
    }
}
