//! Staleness worker.
//!
//! Demotes buses that stopped reporting. The demotion timestamp is the
//! bus's own last accepted change, not the sweep time, so clients keep an
//! honest "minutes ago" figure.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::StaleConfig;
use crate::error::TrackError;
use crate::store::BusStore;

pub async fn run(store: Arc<BusStore>, config: StaleConfig, mut shutdown: watch::Receiver<bool>) {
    let mut interval =
        tokio::time::interval(std::time::Duration::from_secs(config.tick_interval_secs.max(1)));

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("staleness worker stopping");
                return;
            }
            _ = interval.tick() => {
                match run_pass(&store, config.window_secs, Utc::now()).await {
                    Ok(0) => {}
                    Ok(demoted) => info!(demoted, "staleness sweep demoted buses"),
                    // Store trouble skips the tick; the next one retries.
                    Err(err) => warn!(error = %err, "staleness sweep failed, skipping tick"),
                }
            }
        }
    }
}

/// One sweep: demote every online bus whose last accepted change predates
/// `now - window_secs`. Returns the number of demotions.
pub async fn run_pass(
    store: &BusStore,
    window_secs: u64,
    now: DateTime<Utc>,
) -> Result<usize, TrackError> {
    let cutoff = now - Duration::seconds(window_secs as i64);
    let candidates = store.list_stale_candidates(cutoff).await?;

    let mut demoted = 0;
    for bus in candidates {
        // Candidates are online, so last_update_at is set; guard anyway.
        let Some(last_update) = bus.last_update_at else {
            continue;
        };
        match store.mark_stale(&bus.bus_id, last_update).await {
            Ok(_) => {
                demoted += 1;
                info!(
                    bus_id = %bus.bus_id,
                    silent_secs = (now - last_update).num_seconds(),
                    "bus demoted to offline"
                );
            }
            Err(err) => {
                warn!(bus_id = %bus.bus_id, error = %err, "failed to demote stale bus");
            }
        }
    }
    Ok(demoted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BusStatus;
    use crate::store::tests::memory_store;
    use crate::store::ChangeKind;

    #[tokio::test]
    async fn silent_bus_is_demoted_with_its_last_life_sign() {
        let store = memory_store().await;
        let now = Utc::now();
        let last_report = now - Duration::seconds(120);
        store
            .upsert_sample("D1", "BUS001", "RT1", 77.67, 27.49, 30.0, 90.0, last_report)
            .await
            .unwrap();

        let mut rx = store.subscribe_changes();
        let demoted = run_pass(&store, 60, now).await.unwrap();
        assert_eq!(demoted, 1);

        let snapshot = store.get("BUS001").await.unwrap().unwrap();
        assert!(!snapshot.online);
        assert_eq!(snapshot.status, BusStatus::Inactive);
        assert_eq!(snapshot.last_online_at, Some(last_report));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, ChangeKind::Stale);
    }

    #[tokio::test]
    async fn fresh_and_offline_buses_are_untouched() {
        let store = memory_store().await;
        let now = Utc::now();
        store
            .upsert_sample("D1", "FRESH", "RT1", 77.67, 27.49, 30.0, 90.0, now)
            .await
            .unwrap();
        store
            .upsert_toggle("D2", "OFF", "RT1", false, now - Duration::seconds(600))
            .await
            .unwrap();

        let demoted = run_pass(&store, 60, now).await.unwrap();
        assert_eq!(demoted, 0);
        assert!(store.get("FRESH").await.unwrap().unwrap().online);
    }

    #[tokio::test]
    async fn second_sweep_is_a_no_op() {
        let store = memory_store().await;
        let now = Utc::now();
        store
            .upsert_sample("D1", "BUS001", "RT1", 77.67, 27.49, 30.0, 90.0, now - Duration::seconds(120))
            .await
            .unwrap();

        assert_eq!(run_pass(&store, 60, now).await.unwrap(), 1);
        assert_eq!(run_pass(&store, 60, now).await.unwrap(), 0);
    }
}
