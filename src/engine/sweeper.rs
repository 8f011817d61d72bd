//! Background task that periodically expires dispatch requests nobody
//! answered in time. It is the only timeout mechanism: requests do not carry
//! timers of their own.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::Engine;
use crate::api::DispatchAPI;

/// Starts sweeping every `sweep_interval_secs`. Send `true` on the paired
/// sender (or drop it) to stop the task.
pub fn spawn(engine: Arc<Engine>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    let period = engine.config.sweep_interval();

    tokio::spawn(async move {
        tracing::info!(?period, "sweeper started");

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = engine.clock.now();

                    match engine.sweep_expired(now).await {
                        Ok(expired) if !expired.is_empty() => {
                            tracing::info!(count = expired.len(), "swept expired requests");
                        }
                        Ok(_) => {}
                        Err(err) => tracing::warn!(%err, "sweep failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("sweeper stopped");
    })
}

#[tokio::test]
async fn sweeper_expires_requests_until_stopped() {
    use super::testing::{harness, pickup};
    use crate::entities::{BookingStatus, DispatchOutcome, StartDispatch};
    use crate::store::DispatchRequestStore;
    use std::time::Duration;

    let h = harness();
    h.add_driver(1.0).await;
    let booking_id = h.pending_booking().await;

    let request_id = match h
        .engine
        .start_dispatch(StartDispatch::new(booking_id, h.tenant_id, pickup()))
        .await
        .unwrap()
    {
        DispatchOutcome::Searching { request_id, .. } => request_id,
        other => panic!("unexpected {:?}", other),
    };

    h.clock.advance(chrono::Duration::seconds(31));

    let (stop, stopped) = watch::channel(false);
    let handle = spawn(h.engine.clone(), stopped);

    // the first tick fires immediately
    tokio::time::timeout(Duration::from_secs(2), async {
        while h.store.get(request_id).await.is_some() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(h.booking(booking_id).await.status, BookingStatus::NoDriverFound);

    stop.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap();
}
