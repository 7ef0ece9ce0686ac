//! survey-dash: keeps the survey store in sync with the Google sheet and
//! emits the dashboard payload as JSON lines on stdout.
//!
//! Usage: `survey-dash [--once]`
//!
//! `--once` runs one sync (when enabled), prints a single payload and exits.

use std::path::Path;

use survey_dash_lib::config::{load_local_env, Config};
use survey_dash_lib::latency;
use survey_dash_lib::state::AppState;
use survey_dash_lib::sync::SyncOutcome;

fn main() -> anyhow::Result<()> {
    // Environment writes happen here, before the runtime spawns any threads.
    // .env may carry RUST_LOG, so it also precedes the logger.
    load_local_env(Path::new(".env"));
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run())
}

async fn run() -> anyhow::Result<()> {
    let once = std::env::args().skip(1).any(|arg| arg == "--once");
    let state = AppState::new(Config::from_env());

    if let Err(e) = state.store.init().await {
        log::warn!("Survey store unavailable at {}: {e}", state.config.store.path.display());
    }

    if once {
        run_sync_once(&state).await;
        let payload = state.cache.get_payload().await;
        println!("{}", serde_json::to_string(&*payload)?);
        return Ok(());
    }

    if state.config.prewarm_cache_on_start {
        state.cache.prewarm();
    }

    let sync_task = state
        .runs_background_sync()
        .then(|| state.sync.clone().spawn_periodic(state.config.sync_loop_period()));

    let mut ticker = tokio::time::interval(state.config.dashboard_refresh);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_printed = None;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                log::info!("Shutting down");
                break;
            }
        }

        let payload = state.cache.get_payload().await;
        if last_printed.as_ref() == Some(&*payload) {
            continue;
        }
        println!("{}", serde_json::to_string(&*payload)?);
        log::debug!(
            "Diagnostics: {}",
            serde_json::to_string(&latency::snapshot())?
        );
        last_printed = Some((*payload).clone());
    }

    if let Some(task) = sync_task {
        task.abort();
    }
    Ok(())
}

async fn run_sync_once(state: &AppState) {
    match state.sync.sync().await {
        Ok(SyncOutcome::Synced { fetched, inserted }) => {
            log::info!("Sync fetched {fetched} rows, inserted {inserted}");
        }
        Ok(SyncOutcome::Disabled) => {}
        Ok(outcome) => log::info!("Sync: {outcome:?}"),
        Err(e) => log::warn!("Sync failed: {e}"),
    }
}
