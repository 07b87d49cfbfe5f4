//! Scheduled jobs: sortie import and online roster polling.

mod import;
mod online;

pub use import::*;
pub use online::*;

use std::time::Duration;

use rand::Rng;
use thiserror::Error;

use crate::config::Config;
use crate::db::{DbError, Store};
use crate::scrape::Fetcher;

/// Invocation-level errors. Per-unit failures inside a job are logged and
/// counted instead.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("unknown pilot {0:?}")]
    UnknownPilot(String),
    #[error("unknown server {0:?}")]
    UnknownServer(String),
    #[error("unknown player {0}")]
    UnknownPlayer(i64),
    #[error("pilot and server filters cannot be combined")]
    ConflictingFilters,
    #[error(transparent)]
    Db(#[from] DbError),
}

/// Random delay of up to 5% of `period`, capped at 30 seconds.
fn jitter(period: Duration) -> Duration {
    let max_ms = (period.as_millis() / 20).min(30_000) as u64;
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

/// Run both jobs on their intervals until Ctrl-C.
///
/// Jobs run one at a time on the calling task; a tick that comes due while
/// another job is running is delayed, not doubled.
pub async fn watch(store: &Store, fetcher: &Fetcher, cfg: &Config) {
    let mut import_tick = tokio::time::interval(cfg.import_interval);
    import_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut online_tick = tokio::time::interval(cfg.online_interval);
    online_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    tracing::info!(
        import_every = cfg.import_interval.as_secs(),
        online_every = cfg.online_interval.as_secs(),
        "watch mode started"
    );

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("shutting down");
                break;
            }
            _ = online_tick.tick() => {
                tokio::time::sleep(jitter(cfg.online_interval)).await;
                if let Err(e) = poll_online(store, fetcher, None).await {
                    tracing::error!(error = %e, "online poll failed");
                }
            }
            _ = import_tick.tick() => {
                tokio::time::sleep(jitter(cfg.import_interval)).await;
                if let Err(e) = import_sorties(store, fetcher, &ImportFilter::default()).await {
                    tracing::error!(error = %e, "sortie import failed");
                }
            }
        }
    }
}
