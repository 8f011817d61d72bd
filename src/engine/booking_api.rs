use super::helpers::{booking_payload, request_summary};
use super::stats::Settled;
use super::Engine;

use async_trait::async_trait;
use uuid::Uuid;

use crate::{
    api::BookingAPI,
    entities::{Booking, BookingStatus, Event},
    error::{tenant_mismatch_error, Error},
};

/// Attempts at cancelling before giving up on a booking that keeps changing
/// underneath.
const CANCEL_ATTEMPTS: usize = 3;

#[async_trait]
impl BookingAPI for Engine {
    #[tracing::instrument(skip(self))]
    async fn advance_booking(
        &self,
        booking_id: Uuid,
        driver_id: Uuid,
        status: BookingStatus,
    ) -> Result<Booking, Error> {
        let mut booking = self.bookings.get(booking_id).await?;
        let from = booking.status;

        let released = booking.advance(driver_id, status, self.clock.now())?;
        self.save_booking(&booking, from).await?;

        if let Some(driver_id) = released {
            tracing::info!(%driver_id, "releasing driver");
            self.driver_status.set_available(driver_id).await?;
        }

        self.announce(&booking).await;

        Ok(booking)
    }

    #[tracing::instrument(skip(self))]
    async fn cancel_booking(&self, booking_id: Uuid, tenant_id: Uuid) -> Result<Booking, Error> {
        // no acceptance can win once the search is closed
        self.close_search(booking_id, tenant_id).await?;

        let mut attempt = 1;

        loop {
            let mut booking = self.bookings.get(booking_id).await?;

            if booking.tenant_id != tenant_id {
                return Err(tenant_mismatch_error());
            }

            let from = booking.status;
            let released = booking.cancel(self.clock.now())?;

            match self.save_booking(&booking, from).await {
                Ok(()) => {}
                Err(err) if err.is_stale_write_error() && attempt < CANCEL_ATTEMPTS => {
                    tracing::info!(attempt, "booking changed while cancelling, retrying");
                    attempt += 1;
                    continue;
                }
                Err(err) => return Err(err),
            }

            if let Some(driver_id) = released {
                tracing::info!(%driver_id, "releasing driver");
                self.driver_status.set_available(driver_id).await?;
            }

            self.announce(&booking).await;

            return Ok(booking);
        }
    }
}

impl Engine {
    /// Stops the search still running for a booking being cancelled. An
    /// acceptance that already won keeps its driver; the booking write that
    /// follows decides the order.
    async fn close_search(&self, booking_id: Uuid, tenant_id: Uuid) -> Result<(), Error> {
        let request = match self.store.searching_for_booking(booking_id).await {
            Some(request) => request,
            None => return Ok(()),
        };

        match self.store.cancel(request.id, tenant_id).await {
            Ok(request) => {
                tracing::info!(request_id = %request.id, "search stopped");
                self.stats
                    .settled(&request, Settled::Cancelled, self.clock.now())
                    .await;

                self.notify_admins(tenant_id, Event::DispatchCancelled, request_summary(&request))
                    .await;

                Ok(())
            }
            Err(err) if err.is_not_found_error() => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn announce(&self, booking: &Booking) {
        let payload = booking_payload(booking);

        if let Some(driver_id) = booking.assigned_driver_id {
            self.notify_driver(driver_id, Event::StatusChanged, payload.clone())
                .await;
        }

        self.notify_admins(booking.tenant_id, Event::StatusChanged, payload)
            .await;
    }
}

#[cfg(test)]
use super::testing::{harness, harness_wrapping, pickup, Harness};
#[cfg(test)]
use crate::config::Config;
#[cfg(test)]
use crate::external::{memory::MemoryBookingStore, memory::RecordingGateway, BookingStore};
#[cfg(test)]
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
#[cfg(test)]
use std::time::Duration;
#[cfg(test)]
use crate::api::DispatchAPI;
#[cfg(test)]
use crate::entities::{DispatchOutcome, DriverResponse, ResponseOutcome, StartDispatch};
#[cfg(test)]
use crate::store::DispatchRequestStore;

#[cfg(test)]
async fn assigned(h: &Harness) -> (Uuid, Uuid) {
    let driver_id = h.add_driver(1.0).await;
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

    let outcome = h
        .engine
        .handle_driver_response(DriverResponse {
            request_id,
            driver_id,
            accepted: true,
            decline_reason: None,
        })
        .await
        .unwrap();
    assert_eq!(outcome, ResponseOutcome::Assigned { driver_id });

    (booking_id, driver_id)
}

#[tokio::test]
async fn completing_a_trip_releases_the_driver() {
    let h = harness();
    let (booking_id, driver_id) = assigned(&h).await;
    assert!(!h.pool.is_available(driver_id).await);

    for status in [
        BookingStatus::EnRoute,
        BookingStatus::Arrived,
        BookingStatus::InProgress,
    ] {
        h.engine
            .advance_booking(booking_id, driver_id, status)
            .await
            .unwrap();
        assert!(!h.pool.is_available(driver_id).await);
    }

    let booking = h
        .engine
        .advance_booking(booking_id, driver_id, BookingStatus::Completed)
        .await
        .unwrap();

    assert_eq!(booking.status, BookingStatus::Completed);
    assert_eq!(h.booking(booking_id).await.status, BookingStatus::Completed);
    assert!(h.pool.is_available(driver_id).await);
    assert_eq!(
        h.gateway
            .driver_events(driver_id)
            .iter()
            .filter(|event| **event == Event::StatusChanged)
            .count(),
        4
    );
}

#[tokio::test]
async fn another_driver_cannot_advance_the_booking() {
    let h = harness();
    let (booking_id, driver_id) = assigned(&h).await;

    let err = h
        .engine
        .advance_booking(booking_id, Uuid::new_v4(), BookingStatus::EnRoute)
        .await
        .unwrap_err();

    assert!(err.is_driver_mismatch_error());

    let booking = h.booking(booking_id).await;
    assert_eq!(booking.status, BookingStatus::Assigned);
    assert_eq!(booking.assigned_driver_id, Some(driver_id));
}

#[tokio::test]
async fn completed_booking_is_final() {
    let h = harness();
    let (booking_id, driver_id) = assigned(&h).await;

    for status in [
        BookingStatus::EnRoute,
        BookingStatus::Arrived,
        BookingStatus::InProgress,
        BookingStatus::Completed,
    ] {
        h.engine
            .advance_booking(booking_id, driver_id, status)
            .await
            .unwrap();
    }

    assert!(h
        .engine
        .cancel_booking(booking_id, h.tenant_id)
        .await
        .unwrap_err()
        .is_terminal_state_error());
}

#[tokio::test]
async fn cancelling_an_assigned_booking_releases_the_driver() {
    let h = harness();
    let (booking_id, driver_id) = assigned(&h).await;

    assert!(h
        .engine
        .cancel_booking(booking_id, Uuid::new_v4())
        .await
        .unwrap_err()
        .is_tenant_mismatch_error());

    let booking = h
        .engine
        .cancel_booking(booking_id, h.tenant_id)
        .await
        .unwrap();

    assert_eq!(booking.status, BookingStatus::Cancelled);
    assert!(h.pool.is_available(driver_id).await);
}

#[tokio::test]
async fn cancelling_while_dispatching_closes_the_search() {
    let h = harness();
    let driver_id = h.add_driver(1.0).await;
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

    h.engine
        .cancel_booking(booking_id, h.tenant_id)
        .await
        .unwrap();

    assert!(h.store.get(request_id).await.is_none());
    assert_eq!(h.gateway.count(Event::DispatchCancelled), 1);

    let late = h
        .engine
        .handle_driver_response(DriverResponse {
            request_id,
            driver_id,
            accepted: true,
            decline_reason: None,
        })
        .await
        .unwrap();

    assert_eq!(late, ResponseOutcome::RequestClosed);
    assert!(h.pool.is_available(driver_id).await);
    assert_eq!(h.booking(booking_id).await.status, BookingStatus::Cancelled);
}

/// Booking store whose next read, once armed, stalls after fetching the
/// record, so whoever made it holds a stale copy for a while.
#[cfg(test)]
struct StallingReads {
    inner: Arc<MemoryBookingStore>,
    armed: Arc<AtomicBool>,
}

#[cfg(test)]
#[async_trait]
impl BookingStore for StallingReads {
    async fn get(&self, booking_id: Uuid) -> Result<Booking, Error> {
        let booking = self.inner.get(booking_id).await?;

        if self.armed.swap(false, Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        Ok(booking)
    }

    async fn set_status(
        &self,
        booking_id: Uuid,
        expected: BookingStatus,
        status: BookingStatus,
        driver_id: Option<Uuid>,
    ) -> Result<(), Error> {
        self.inner
            .set_status(booking_id, expected, status, driver_id)
            .await
    }
}

#[cfg(test)]
fn stalling_harness() -> (Harness, Arc<AtomicBool>) {
    let armed = Arc::new(AtomicBool::new(false));
    let switch = armed.clone();

    let h = harness_wrapping(Config::default(), RecordingGateway::new(), move |inner| {
        Arc::new(StallingReads { inner, armed }) as Arc<dyn BookingStore>
    });

    (h, switch)
}

#[tokio::test]
async fn cancel_during_assignment_never_leaves_the_driver_busy() {
    let (h, stall_next_read) = stalling_harness();
    let driver_id = h.add_driver(1.0).await;
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

    // the acceptance wins the request, then stalls holding a dispatching copy
    stall_next_read.store(true, Ordering::SeqCst);
    let engine = h.engine.clone();
    let acceptance = tokio::spawn(async move {
        engine
            .handle_driver_response(DriverResponse {
                request_id,
                driver_id,
                accepted: true,
                decline_reason: None,
            })
            .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;

    let cancelled = h
        .engine
        .cancel_booking(booking_id, h.tenant_id)
        .await
        .unwrap();
    assert_eq!(cancelled.status, BookingStatus::Cancelled);

    let err = acceptance.await.unwrap().unwrap_err();
    assert!(err.is_stale_write_error());

    let booking = h.booking(booking_id).await;
    assert_eq!(booking.status, BookingStatus::Cancelled);
    assert_eq!(booking.assigned_driver_id, None);
    assert!(h.pool.is_available(driver_id).await);
    assert!(!h.gateway.driver_events(driver_id).contains(&Event::Assigned));
}

#[tokio::test]
async fn cancel_retries_against_a_booking_that_moved_on() {
    let (h, stall_next_read) = stalling_harness();
    let (booking_id, driver_id) = assigned(&h).await;

    // cancel reads `Assigned`, then the driver reports `EnRoute` meanwhile
    stall_next_read.store(true, Ordering::SeqCst);
    let engine = h.engine.clone();
    let tenant_id = h.tenant_id;
    let cancellation =
        tokio::spawn(async move { engine.cancel_booking(booking_id, tenant_id).await });

    tokio::time::sleep(Duration::from_millis(50)).await;

    h.engine
        .advance_booking(booking_id, driver_id, BookingStatus::EnRoute)
        .await
        .unwrap();

    let cancelled = cancellation.await.unwrap().unwrap();
    assert_eq!(cancelled.status, BookingStatus::Cancelled);

    let booking = h.booking(booking_id).await;
    assert_eq!(booking.status, BookingStatus::Cancelled);
    assert_eq!(booking.assigned_driver_id, Some(driver_id));
    assert_eq!(
        booking.history.iter().map(|change| change.status).collect::<Vec<_>>(),
        vec![
            BookingStatus::Pending,
            BookingStatus::Dispatching,
            BookingStatus::Assigned,
            BookingStatus::EnRoute,
            BookingStatus::Cancelled,
        ]
    );
    assert!(h.pool.is_available(driver_id).await);
}

#[tokio::test]
async fn cancel_after_the_search_gave_up_is_refused() {
    let h = harness();
    let driver_id = h.add_driver(1.0).await;
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

    let outcome = h
        .engine
        .handle_driver_response(DriverResponse {
            request_id,
            driver_id,
            accepted: false,
            decline_reason: None,
        })
        .await
        .unwrap();
    assert_eq!(outcome, ResponseOutcome::AllDeclined);

    assert!(h
        .engine
        .cancel_booking(booking_id, h.tenant_id)
        .await
        .unwrap_err()
        .is_terminal_state_error());
    assert_eq!(h.booking(booking_id).await.status, BookingStatus::NoDriverFound);
}
