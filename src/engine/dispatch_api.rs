use super::helpers::{deliver, dispatch_request_payload, request_summary};
use super::stats::Settled;
use super::Engine;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use uuid::Uuid;

use crate::{
    api::DispatchAPI,
    config::Config,
    entities::{
        BookingStatus, DeclineProgress, DispatchOutcome, DispatchRequest, DispatchStats,
        DispatchStatus, DriverResponse, Event, NotifiedDriver, ResponseOutcome, StartDispatch,
    },
    error::{not_found_error, tenant_mismatch_error, Error},
    geo, search,
};

#[async_trait]
impl DispatchAPI for Engine {
    #[tracing::instrument(skip(self))]
    async fn start_dispatch(&self, params: StartDispatch) -> Result<DispatchOutcome, Error> {
        self.validate_start(&params)?;

        let radius_km = params.radius_km.unwrap_or(self.config.search_radius_km);
        let max_wait = params
            .max_wait_secs
            .map(Duration::seconds)
            .unwrap_or_else(|| self.config.driver_response_timeout());

        let mut booking = self.bookings.get(params.booking_id).await?;

        if booking.tenant_id != params.tenant_id {
            return Err(tenant_mismatch_error());
        }

        booking.check_start_dispatch()?;

        tracing::info!("fetching available drivers...");

        let vehicle_type = params.vehicle_type.as_deref();
        let pool = self
            .drivers
            .list_available(params.tenant_id, vehicle_type)
            .await?;

        let eligible = search::filter(
            params.pickup,
            vehicle_type,
            radius_km,
            &params.exclude_ids,
            &pool,
        );

        let ranked = search::prioritize(
            &params.preferred_ids,
            search::rank(self.config.assignment_strategy, params.pickup, &eligible),
        );

        if ranked.is_empty() {
            tracing::info!(pool = pool.len(), "no eligible drivers");
            return Ok(DispatchOutcome::NoEligibleDrivers);
        }

        let notified: Vec<NotifiedDriver> = ranked
            .into_iter()
            .take(self.config.max_drivers_to_notify)
            .map(|driver| NotifiedDriver {
                driver_id: driver.id(),
                distance_km: driver.distance_km,
                eta_minutes: geo::estimate_travel_minutes(
                    driver.distance_km,
                    self.config.average_speed_kmh,
                ),
            })
            .collect();

        let now = self.clock.now();

        booking.start_dispatch(now)?;
        self.save_booking(&booking, BookingStatus::Pending).await?;

        let request = DispatchRequest::new(
            params.booking_id,
            params.tenant_id,
            params.pickup,
            params.vehicle_type.clone(),
            notified,
            now,
            max_wait,
        );
        let request_id = self.store.create(request.clone()).await;
        self.stats.started(request.tenant_id).await;

        tracing::info!(%request_id, drivers = request.notified().len(), "dispatch started");

        self.fan_out(&request);

        self.notify_admins(
            request.tenant_id,
            Event::DispatchStarted,
            request_summary(&request),
        )
        .await;

        Ok(DispatchOutcome::Searching {
            request_id,
            drivers_notified: request.notified().len(),
            expires_at: request.expires_at,
        })
    }

    #[tracing::instrument(skip(self))]
    async fn handle_driver_response(
        &self,
        response: DriverResponse,
    ) -> Result<ResponseOutcome, Error> {
        match response.accepted {
            true => self.accept(response.request_id, response.driver_id).await,
            false => {
                self.decline(
                    response.request_id,
                    response.driver_id,
                    response.decline_reason.as_deref(),
                )
                .await
            }
        }
    }

    #[tracing::instrument(skip(self))]
    async fn cancel_dispatch(&self, request_id: Uuid, tenant_id: Uuid) -> Result<(), Error> {
        let request = self.store.cancel(request_id, tenant_id).await?;
        self.stats
            .settled(&request, Settled::Cancelled, self.clock.now())
            .await;

        let mut booking = self.bookings.get(request.booking_id).await?;
        let from = booking.status;
        booking.reset_dispatch(self.clock.now())?;
        self.save_booking(&booking, from).await?;

        tracing::info!("dispatch cancelled");

        self.notify_admins(tenant_id, Event::DispatchCancelled, request_summary(&request))
            .await;

        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, Error> {
        let expired = self.store.expire_older_than(now).await;
        let mut expired_ids = Vec::with_capacity(expired.len());

        for request in expired {
            tracing::info!(request_id = %request.id, "dispatch request expired");
            self.stats.settled(&request, Settled::Failed, now).await;

            if let Err(err) = self.mark_no_driver(request.booking_id).await {
                tracing::warn!(
                    request_id = %request.id,
                    booking_id = %request.booking_id,
                    %err,
                    "could not mark booking as without driver"
                );
            }

            self.store.delete(request.id).await;

            self.notify_admins(request.tenant_id, Event::DispatchFailed, request_summary(&request))
                .await;

            expired_ids.push(request.id);
        }

        let purged = self
            .store
            .purge_deleted(now - self.config.resolved_retention())
            .await;

        if purged > 0 {
            tracing::info!(purged, "forgot resolved dispatch requests");
        }

        Ok(expired_ids)
    }

    #[tracing::instrument(skip(self))]
    async fn dispatch_status(
        &self,
        request_id: Uuid,
        tenant_id: Uuid,
    ) -> Result<DispatchStatus, Error> {
        let status = self
            .store
            .status(request_id)
            .await
            .ok_or_else(not_found_error)?;

        if status.tenant_id != tenant_id {
            return Err(tenant_mismatch_error());
        }

        Ok(status)
    }

    #[tracing::instrument(skip(self))]
    async fn pending_requests(&self, tenant_id: Uuid) -> Result<Vec<DispatchStatus>, Error> {
        Ok(self.store.pending(tenant_id).await)
    }

    #[tracing::instrument(skip(self))]
    async fn dispatch_stats(&self, tenant_id: Uuid) -> Result<DispatchStats, Error> {
        Ok(self.stats.snapshot(tenant_id).await)
    }

    fn config(&self) -> &Config {
        &self.config
    }
}

impl Engine {
    /// One detached task per driver so a slow recipient never holds up the
    /// others or the caller.
    fn fan_out(&self, request: &DispatchRequest) {
        for driver in request.notified() {
            tokio::spawn(deliver(
                self.notifier.clone(),
                self.config.notify_timeout(),
                driver.driver_id,
                Event::DispatchRequest,
                dispatch_request_payload(request, driver),
            ));
        }
    }

    async fn accept(&self, request_id: Uuid, driver_id: Uuid) -> Result<ResponseOutcome, Error> {
        // don't reserve a driver for an acceptance that cannot win
        if let Err(rejection) = self.store.check_eligible(request_id, driver_id).await {
            tracing::info!(?rejection, "acceptance rejected");
            return Ok(rejection.into());
        }

        match self.driver_status.set_busy(driver_id).await {
            Ok(()) => {}
            Err(err) if err.is_driver_unavailable_error() => {
                tracing::info!("driver is no longer available");
                return Ok(ResponseOutcome::DriverUnavailable);
            }
            Err(err) => return Err(err),
        }

        let request = match self.store.try_resolve(request_id, driver_id).await {
            Ok(request) => request,
            Err(rejection) => {
                tracing::info!(?rejection, "acceptance lost the race");
                self.driver_status.set_available(driver_id).await?;
                return Ok(rejection.into());
            }
        };

        let assignment = self.assign_booking(request.booking_id, driver_id).await;
        self.store.delete(request.id).await;

        let settled = match assignment {
            Ok(()) => Settled::Assigned,
            Err(_) => Settled::Failed,
        };
        self.stats
            .settled(&request, settled, self.clock.now())
            .await;

        if let Err(err) = assignment {
            tracing::warn!(%err, "booking could not be assigned, releasing driver");
            self.driver_status.set_available(driver_id).await?;
            return Err(err);
        }

        tracing::info!("driver assigned");

        let taken = json!({
            "request_id": request.id,
            "booking_id": request.booking_id,
        });

        let losers = request
            .notified_ids()
            .filter(|id| *id != driver_id)
            .map(|id| self.notify_driver(id, Event::Taken, taken.clone()));

        futures::future::join_all(losers).await;

        self.notify_driver(
            driver_id,
            Event::Assigned,
            json!({
                "request_id": request.id,
                "booking_id": request.booking_id,
                "pickup": request.pickup,
            }),
        )
        .await;

        self.notify_admins(
            request.tenant_id,
            Event::DispatchCompleted,
            request_summary(&request),
        )
        .await;

        Ok(ResponseOutcome::Assigned { driver_id })
    }

    async fn decline(
        &self,
        request_id: Uuid,
        driver_id: Uuid,
        reason: Option<&str>,
    ) -> Result<ResponseOutcome, Error> {
        let request = match self.store.record_decline(request_id, driver_id).await {
            Ok(DeclineProgress::Waiting { remaining }) => {
                tracing::info!(?reason, remaining, "driver declined");
                return Ok(ResponseOutcome::Declined { remaining });
            }
            Ok(DeclineProgress::AllDeclined(request)) => request,
            Err(rejection) => {
                tracing::info!(?rejection, "decline rejected");
                return Ok(rejection.into());
            }
        };

        tracing::info!(?reason, "every notified driver declined");
        self.stats
            .settled(&request, Settled::Failed, self.clock.now())
            .await;

        let marked = self.mark_no_driver(request.booking_id).await;
        self.store.delete(request.id).await;
        marked?;

        self.notify_admins(request.tenant_id, Event::DispatchFailed, request_summary(&request))
            .await;

        Ok(ResponseOutcome::AllDeclined)
    }

    async fn assign_booking(&self, booking_id: Uuid, driver_id: Uuid) -> Result<(), Error> {
        let mut booking = self.bookings.get(booking_id).await?;
        let from = booking.status;
        booking.assign_driver(driver_id, self.clock.now())?;
        self.save_booking(&booking, from).await
    }
}

#[cfg(test)]
use super::testing::{harness, harness_with, pickup, Harness};
#[cfg(test)]
use crate::clock::Clock;
#[cfg(test)]
use crate::external::memory::RecordingGateway;
#[cfg(test)]
use crate::external::DriverStatusStore;
#[cfg(test)]
use crate::store::DispatchRequestStore;

#[cfg(test)]
async fn start(h: &Harness, booking_id: Uuid) -> Uuid {
    start_with(h, StartDispatch::new(booking_id, h.tenant_id, pickup())).await
}

#[cfg(test)]
async fn start_with(h: &Harness, params: StartDispatch) -> Uuid {
    match h.engine.start_dispatch(params).await.unwrap() {
        DispatchOutcome::Searching { request_id, .. } => request_id,
        other => panic!("expected a search, got {:?}", other),
    }
}

#[cfg(test)]
fn accept(request_id: Uuid, driver_id: Uuid) -> DriverResponse {
    DriverResponse {
        request_id,
        driver_id,
        accepted: true,
        decline_reason: None,
    }
}

#[cfg(test)]
fn decline(request_id: Uuid, driver_id: Uuid) -> DriverResponse {
    DriverResponse {
        request_id,
        driver_id,
        accepted: false,
        decline_reason: Some("too far".into()),
    }
}

#[tokio::test]
async fn nearest_drivers_within_radius_are_notified_in_order() {
    let h = harness();
    let near = h.add_driver(1.0).await;
    let mid = h.add_driver(4.0).await;
    let far = h.add_driver(9.0).await;
    let booking_id = h.pending_booking().await;

    let outcome = h
        .engine
        .start_dispatch(StartDispatch::new(booking_id, h.tenant_id, pickup()))
        .await
        .unwrap();

    let request_id = match outcome {
        DispatchOutcome::Searching {
            request_id,
            drivers_notified,
            ..
        } => {
            assert_eq!(drivers_notified, 2);
            request_id
        }
        other => panic!("unexpected {:?}", other),
    };

    let request = h.store.get(request_id).await.unwrap();
    assert_eq!(request.notified_ids().collect::<Vec<_>>(), vec![near, mid]);
    assert_eq!(h.booking(booking_id).await.status, BookingStatus::Dispatching);

    h.wait_for(Event::DispatchRequest, 2).await;
    assert_eq!(h.gateway.driver_events(near), vec![Event::DispatchRequest]);
    assert!(h.gateway.driver_events(far).is_empty());
    assert_eq!(h.gateway.admin_events(h.tenant_id), vec![Event::DispatchStarted]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn simultaneous_accepts_assign_exactly_one_driver() {
    let h = harness();
    let d1 = h.add_driver(1.0).await;
    let d2 = h.add_driver(2.0).await;
    let booking_id = h.pending_booking().await;
    let request_id = start(&h, booking_id).await;

    let (r1, r2) = tokio::join!(
        tokio::spawn({
            let engine = h.engine.clone();
            async move { engine.handle_driver_response(accept(request_id, d1)).await }
        }),
        tokio::spawn({
            let engine = h.engine.clone();
            async move { engine.handle_driver_response(accept(request_id, d2)).await }
        }),
    );

    let outcomes = [r1.unwrap().unwrap(), r2.unwrap().unwrap()];
    let winners: Vec<Uuid> = outcomes
        .iter()
        .filter_map(|outcome| match outcome {
            ResponseOutcome::Assigned { driver_id } => Some(*driver_id),
            _ => None,
        })
        .collect();

    assert_eq!(winners.len(), 1);
    assert!(outcomes.contains(&ResponseOutcome::AlreadyAssigned));

    let winner = winners[0];
    let loser = if winner == d1 { d2 } else { d1 };

    let booking = h.booking(booking_id).await;
    assert_eq!(booking.status, BookingStatus::Assigned);
    assert_eq!(booking.assigned_driver_id, Some(winner));

    assert!(!h.pool.is_available(winner).await);
    assert!(h.pool.is_available(loser).await);

    assert!(h.gateway.driver_events(loser).contains(&Event::Taken));
    assert!(h.gateway.driver_events(winner).contains(&Event::Assigned));
    assert_eq!(h.gateway.count(Event::DispatchCompleted), 1);
    assert!(h.store.get(request_id).await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_concurrent_accepts_have_one_winner() {
    let config = Config {
        max_drivers_to_notify: 10,
        ..Config::default()
    };
    let h = harness_with(config, RecordingGateway::new());

    let mut drivers = vec![];
    for i in 0..10 {
        drivers.push(h.add_driver(0.5 + i as f64 * 0.3).await);
    }

    let booking_id = h.pending_booking().await;
    let request_id = start(&h, booking_id).await;

    let handles: Vec<_> = drivers
        .iter()
        .map(|&driver_id| {
            let engine = h.engine.clone();
            tokio::spawn(async move {
                engine
                    .handle_driver_response(accept(request_id, driver_id))
                    .await
            })
        })
        .collect();

    let mut assigned = 0;
    for outcome in futures::future::join_all(handles).await {
        match outcome.unwrap().unwrap() {
            ResponseOutcome::Assigned { .. } => assigned += 1,
            ResponseOutcome::AlreadyAssigned => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    assert_eq!(assigned, 1);

    let mut busy = 0;
    for driver_id in drivers {
        if !h.pool.is_available(driver_id).await {
            busy += 1;
        }
    }
    assert_eq!(busy, 1);
}

#[tokio::test]
async fn every_driver_declining_fails_the_booking_once() {
    let h = harness();
    let drivers = [
        h.add_driver(1.0).await,
        h.add_driver(2.0).await,
        h.add_driver(3.0).await,
    ];
    let booking_id = h.pending_booking().await;
    let request_id = start(&h, booking_id).await;

    let first = h
        .engine
        .handle_driver_response(decline(request_id, drivers[0]))
        .await
        .unwrap();
    assert_eq!(first, ResponseOutcome::Declined { remaining: 2 });

    let second = h
        .engine
        .handle_driver_response(decline(request_id, drivers[1]))
        .await
        .unwrap();
    assert_eq!(second, ResponseOutcome::Declined { remaining: 1 });
    assert_eq!(h.booking(booking_id).await.status, BookingStatus::Dispatching);

    let third = h
        .engine
        .handle_driver_response(decline(request_id, drivers[2]))
        .await
        .unwrap();
    assert_eq!(third, ResponseOutcome::AllDeclined);

    assert_eq!(h.booking(booking_id).await.status, BookingStatus::NoDriverFound);
    assert_eq!(h.gateway.count(Event::DispatchFailed), 1);

    // a repeated reply changes nothing
    let again = h
        .engine
        .handle_driver_response(decline(request_id, drivers[2]))
        .await
        .unwrap();
    assert_eq!(again, ResponseOutcome::RequestClosed);
    assert_eq!(h.gateway.count(Event::DispatchFailed), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_last_declines_fail_the_dispatch_once() {
    let config = Config {
        max_drivers_to_notify: 8,
        ..Config::default()
    };
    let h = harness_with(config, RecordingGateway::new());

    let mut drivers = vec![];
    for i in 0..8 {
        drivers.push(h.add_driver(0.5 + i as f64 * 0.3).await);
    }

    let booking_id = h.pending_booking().await;
    let request_id = start(&h, booking_id).await;

    let handles: Vec<_> = drivers
        .iter()
        .map(|&driver_id| {
            let engine = h.engine.clone();
            tokio::spawn(async move {
                engine
                    .handle_driver_response(decline(request_id, driver_id))
                    .await
            })
        })
        .collect();

    let mut all_declined = 0;
    for outcome in futures::future::join_all(handles).await {
        match outcome.unwrap().unwrap() {
            ResponseOutcome::AllDeclined => all_declined += 1,
            ResponseOutcome::Declined { .. } => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    assert_eq!(all_declined, 1);
    assert_eq!(h.gateway.count(Event::DispatchFailed), 1);
    assert_eq!(h.booking(booking_id).await.status, BookingStatus::NoDriverFound);
    assert!(h.store.get(request_id).await.is_none());
}

#[tokio::test]
async fn sweep_expires_unanswered_requests() {
    let h = harness();
    let driver_id = h.add_driver(1.0).await;
    let booking_id = h.pending_booking().await;

    let mut params = StartDispatch::new(booking_id, h.tenant_id, pickup());
    params.max_wait_secs = Some(30);
    let request_id = start_with(&h, params).await;

    assert!(h.engine.sweep_expired(h.clock.now()).await.unwrap().is_empty());

    h.clock.advance(Duration::seconds(31));
    let expired = h.engine.sweep_expired(h.clock.now()).await.unwrap();
    assert_eq!(expired, vec![request_id]);

    let status = h.store.status(request_id).await.unwrap();
    assert_eq!(status.status, "expired");
    assert_eq!(h.booking(booking_id).await.status, BookingStatus::NoDriverFound);
    assert_eq!(h.gateway.count(Event::DispatchFailed), 1);

    let late = h
        .engine
        .handle_driver_response(accept(request_id, driver_id))
        .await
        .unwrap();
    assert_eq!(late, ResponseOutcome::Expired);
    assert!(h.pool.is_available(driver_id).await);

    // a second sweep finds nothing new
    assert!(h.engine.sweep_expired(h.clock.now()).await.unwrap().is_empty());
    assert_eq!(h.gateway.count(Event::DispatchFailed), 1);
}

#[tokio::test]
async fn late_accept_is_expired_before_any_sweep() {
    let h = harness();
    let driver_id = h.add_driver(1.0).await;
    let booking_id = h.pending_booking().await;
    let request_id = start(&h, booking_id).await;

    h.clock.advance(Duration::seconds(31));

    let outcome = h
        .engine
        .handle_driver_response(accept(request_id, driver_id))
        .await
        .unwrap();

    assert_eq!(outcome, ResponseOutcome::Expired);
    assert_eq!(h.booking(booking_id).await.status, BookingStatus::Dispatching);
    assert!(h.pool.is_available(driver_id).await);
}

#[tokio::test]
async fn drivers_never_notified_are_not_eligible() {
    let h = harness();
    let notified = h.add_driver(1.0).await;
    let outsider = h.add_driver(30.0).await;
    let booking_id = h.pending_booking().await;
    let request_id = start(&h, booking_id).await;

    for response in [accept(request_id, outsider), decline(request_id, outsider)] {
        assert_eq!(
            h.engine.handle_driver_response(response).await.unwrap(),
            ResponseOutcome::DriverNotEligible
        );
    }

    h.engine
        .handle_driver_response(accept(request_id, notified))
        .await
        .unwrap();

    assert_eq!(
        h.engine
            .handle_driver_response(accept(request_id, outsider))
            .await
            .unwrap(),
        ResponseOutcome::DriverNotEligible
    );
}

#[tokio::test]
async fn driver_who_declined_cannot_accept() {
    let h = harness();
    let d1 = h.add_driver(1.0).await;
    h.add_driver(2.0).await;
    let booking_id = h.pending_booking().await;
    let request_id = start(&h, booking_id).await;

    h.engine
        .handle_driver_response(decline(request_id, d1))
        .await
        .unwrap();

    assert_eq!(
        h.engine
            .handle_driver_response(accept(request_id, d1))
            .await
            .unwrap(),
        ResponseOutcome::DriverNotEligible
    );
}

#[tokio::test]
async fn unknown_request_is_reported() {
    let h = harness();
    let outcome = h
        .engine
        .handle_driver_response(accept(Uuid::new_v4(), Uuid::new_v4()))
        .await
        .unwrap();

    assert_eq!(outcome, ResponseOutcome::UnknownRequest);
}

#[tokio::test]
async fn empty_pool_touches_nothing() {
    let h = harness();
    h.add_driver(12.0).await;
    let booking_id = h.pending_booking().await;

    let outcome = h
        .engine
        .start_dispatch(StartDispatch::new(booking_id, h.tenant_id, pickup()))
        .await
        .unwrap();

    assert_eq!(outcome, DispatchOutcome::NoEligibleDrivers);
    assert_eq!(h.booking(booking_id).await.status, BookingStatus::Pending);
    assert_eq!(h.store.live_count().await, 0);
    assert!(h.gateway.deliveries().is_empty());
}

#[tokio::test]
async fn wider_radius_reaches_further_drivers() {
    let h = harness();
    h.add_driver(12.0).await;
    let booking_id = h.pending_booking().await;

    let mut params = StartDispatch::new(booking_id, h.tenant_id, pickup());
    params.radius_km = Some(15.0);

    start_with(&h, params).await;
}

#[tokio::test]
async fn invalid_input_is_rejected_before_any_write() {
    let h = harness();
    h.add_driver(1.0).await;
    let booking_id = h.pending_booking().await;

    let mut params = StartDispatch::new(booking_id, h.tenant_id, pickup());
    params.radius_km = Some(0.0);
    assert!(h
        .engine
        .start_dispatch(params)
        .await
        .unwrap_err()
        .is_invalid_input_error());

    let mut params = StartDispatch::new(booking_id, h.tenant_id, pickup());
    params.radius_km = Some(40.0);
    assert!(h.engine.start_dispatch(params).await.is_err());

    let params = StartDispatch::new(
        booking_id,
        h.tenant_id,
        crate::entities::Coordinates::new(123.0, 2.0),
    );
    assert!(h.engine.start_dispatch(params).await.is_err());

    let mut params = StartDispatch::new(booking_id, h.tenant_id, pickup());
    params.vehicle_type = Some(" ".into());
    assert!(h.engine.start_dispatch(params).await.is_err());

    assert_eq!(h.booking(booking_id).await.status, BookingStatus::Pending);
    assert_eq!(h.store.live_count().await, 0);
}

#[tokio::test]
async fn response_window_outside_bounds_is_invalid_input() {
    let h = harness();
    h.add_driver(1.0).await;
    let booking_id = h.pending_booking().await;

    for max_wait_secs in [i64::MAX / 2, i64::MAX, i64::MIN, 0, 9, 121] {
        let mut params = StartDispatch::new(booking_id, h.tenant_id, pickup());
        params.max_wait_secs = Some(max_wait_secs);

        // run on its own task so a panic would surface as a join error
        let engine = h.engine.clone();
        let result = tokio::spawn(async move { engine.start_dispatch(params).await })
            .await
            .unwrap();

        assert!(result.unwrap_err().is_invalid_input_error());
    }

    assert_eq!(h.booking(booking_id).await.status, BookingStatus::Pending);

    let mut params = StartDispatch::new(booking_id, h.tenant_id, pickup());
    params.max_wait_secs = Some(120);

    match h.engine.start_dispatch(params).await.unwrap() {
        DispatchOutcome::Searching { expires_at, .. } => {
            assert_eq!(expires_at, h.clock.now() + Duration::seconds(120))
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn start_dispatch_requires_a_pending_booking_of_the_tenant() {
    let h = harness();
    h.add_driver(1.0).await;
    let booking_id = h.pending_booking().await;

    let err = h
        .engine
        .start_dispatch(StartDispatch::new(booking_id, Uuid::new_v4(), pickup()))
        .await
        .unwrap_err();
    assert!(err.is_tenant_mismatch_error());

    start(&h, booking_id).await;

    let err = h
        .engine
        .start_dispatch(StartDispatch::new(booking_id, h.tenant_id, pickup()))
        .await
        .unwrap_err();
    assert!(err.is_invalid_transition_error());
}

#[tokio::test]
async fn preferred_drivers_are_offered_first() {
    let config = Config {
        max_drivers_to_notify: 2,
        ..Config::default()
    };
    let h = harness_with(config, RecordingGateway::new());
    let near = h.add_driver(1.0).await;
    h.add_driver(2.0).await;
    let preferred = h.add_driver(3.0).await;
    let booking_id = h.pending_booking().await;

    let mut params = StartDispatch::new(booking_id, h.tenant_id, pickup());
    params.preferred_ids = vec![preferred];
    let request_id = start_with(&h, params).await;

    let request = h.store.get(request_id).await.unwrap();
    assert_eq!(
        request.notified_ids().collect::<Vec<_>>(),
        vec![preferred, near]
    );
}

#[tokio::test]
async fn excluded_drivers_are_skipped() {
    let h = harness();
    let excluded = h.add_driver(1.0).await;
    let other = h.add_driver(2.0).await;
    let booking_id = h.pending_booking().await;

    let mut params = StartDispatch::new(booking_id, h.tenant_id, pickup());
    params.exclude_ids = vec![excluded];
    let request_id = start_with(&h, params).await;

    let request = h.store.get(request_id).await.unwrap();
    assert_eq!(request.notified_ids().collect::<Vec<_>>(), vec![other]);
}

#[tokio::test]
async fn busy_driver_cannot_win_and_request_keeps_searching() {
    let h = harness();
    let d1 = h.add_driver(1.0).await;
    let d2 = h.add_driver(2.0).await;
    let booking_id = h.pending_booking().await;
    let request_id = start(&h, booking_id).await;

    // d1 took another job in the meantime
    h.pool.set_busy(d1).await.unwrap();

    assert_eq!(
        h.engine
            .handle_driver_response(accept(request_id, d1))
            .await
            .unwrap(),
        ResponseOutcome::DriverUnavailable
    );
    assert!(h.store.get(request_id).await.unwrap().is_searching());

    assert_eq!(
        h.engine
            .handle_driver_response(accept(request_id, d2))
            .await
            .unwrap(),
        ResponseOutcome::Assigned { driver_id: d2 }
    );
}

#[tokio::test]
async fn unreachable_driver_does_not_abort_dispatch() {
    let unreachable = Uuid::new_v4();
    let h = harness_with(
        Config::default(),
        RecordingGateway::new().failing_for(unreachable),
    );
    h.add_driver_as(unreachable, 1.0).await;
    let reachable = h.add_driver(2.0).await;
    let booking_id = h.pending_booking().await;

    start(&h, booking_id).await;

    h.wait_for(Event::DispatchRequest, 1).await;
    assert_eq!(h.gateway.driver_events(reachable), vec![Event::DispatchRequest]);
    assert!(h.gateway.driver_events(unreachable).is_empty());
}

#[tokio::test]
async fn slow_driver_does_not_delay_the_others() {
    let slow = Uuid::new_v4();
    let h = harness_with(
        Config::default(),
        RecordingGateway::new().delayed_for(slow, std::time::Duration::from_secs(10)),
    );
    h.add_driver_as(slow, 1.0).await;
    let quick = h.add_driver(2.0).await;
    let booking_id = h.pending_booking().await;

    let started = std::time::Instant::now();
    start(&h, booking_id).await;
    assert!(started.elapsed() < std::time::Duration::from_secs(1));

    h.wait_for(Event::DispatchRequest, 1).await;
    assert_eq!(h.gateway.driver_events(quick), vec![Event::DispatchRequest]);
    assert!(h.gateway.driver_events(slow).is_empty());
}

#[tokio::test]
async fn cancel_resets_the_booking_once() {
    let h = harness();
    let driver_id = h.add_driver(1.0).await;
    let booking_id = h.pending_booking().await;
    let request_id = start(&h, booking_id).await;

    assert!(h
        .engine
        .cancel_dispatch(request_id, Uuid::new_v4())
        .await
        .unwrap_err()
        .is_tenant_mismatch_error());

    h.engine
        .cancel_dispatch(request_id, h.tenant_id)
        .await
        .unwrap();

    assert_eq!(h.booking(booking_id).await.status, BookingStatus::Pending);
    assert_eq!(h.gateway.count(Event::DispatchCancelled), 1);

    assert!(h
        .engine
        .cancel_dispatch(request_id, h.tenant_id)
        .await
        .unwrap_err()
        .is_not_found_error());
    assert_eq!(h.gateway.count(Event::DispatchCancelled), 1);

    assert_eq!(
        h.engine
            .handle_driver_response(accept(request_id, driver_id))
            .await
            .unwrap(),
        ResponseOutcome::RequestClosed
    );
}

#[tokio::test]
async fn cancel_after_assignment_is_not_found() {
    let h = harness();
    let driver_id = h.add_driver(1.0).await;
    let booking_id = h.pending_booking().await;
    let request_id = start(&h, booking_id).await;

    h.engine
        .handle_driver_response(accept(request_id, driver_id))
        .await
        .unwrap();

    assert!(h
        .engine
        .cancel_dispatch(request_id, h.tenant_id)
        .await
        .unwrap_err()
        .is_not_found_error());

    let booking = h.booking(booking_id).await;
    assert_eq!(booking.status, BookingStatus::Assigned);
    assert_eq!(booking.assigned_driver_id, Some(driver_id));
    assert_eq!(h.gateway.count(Event::DispatchCancelled), 0);
}

#[tokio::test]
async fn cancel_after_expiry_is_not_found() {
    let h = harness();
    h.add_driver(1.0).await;
    let booking_id = h.pending_booking().await;
    let request_id = start(&h, booking_id).await;

    h.clock.advance(Duration::seconds(31));
    h.engine.sweep_expired(h.clock.now()).await.unwrap();

    assert!(h
        .engine
        .cancel_dispatch(request_id, h.tenant_id)
        .await
        .unwrap_err()
        .is_not_found_error());
    assert_eq!(h.booking(booking_id).await.status, BookingStatus::NoDriverFound);
}

#[tokio::test]
async fn status_is_scoped_to_the_tenant() {
    let h = harness();
    let driver_id = h.add_driver(1.0).await;
    let booking_id = h.pending_booking().await;
    let request_id = start(&h, booking_id).await;

    let status = h
        .engine
        .dispatch_status(request_id, h.tenant_id)
        .await
        .unwrap();
    assert_eq!(status.status, "searching");
    assert_eq!(status.drivers_notified, 1);
    assert_eq!(status.time_remaining_ms, 30_000);

    assert!(h
        .engine
        .dispatch_status(request_id, Uuid::new_v4())
        .await
        .unwrap_err()
        .is_tenant_mismatch_error());

    h.engine
        .handle_driver_response(accept(request_id, driver_id))
        .await
        .unwrap();

    let status = h
        .engine
        .dispatch_status(request_id, h.tenant_id)
        .await
        .unwrap();
    assert_eq!(status.status, "assigned");
    assert_eq!(status.assigned_driver, Some(driver_id));
}

#[tokio::test]
async fn resolved_requests_are_forgotten_after_retention() {
    let h = harness();
    let driver_id = h.add_driver(1.0).await;
    let booking_id = h.pending_booking().await;
    let request_id = start(&h, booking_id).await;

    h.engine
        .handle_driver_response(accept(request_id, driver_id))
        .await
        .unwrap();

    h.clock.advance(Duration::seconds(601));
    h.engine.sweep_expired(h.clock.now()).await.unwrap();

    assert!(h
        .engine
        .dispatch_status(request_id, h.tenant_id)
        .await
        .unwrap_err()
        .is_not_found_error());
}

#[tokio::test]
async fn stats_count_each_settled_request_once() {
    let h = harness();
    let first = h.add_driver(1.0).await;
    let second = h.add_driver(2.0).await;

    // assigned after 3s
    let request_id = start(&h, h.pending_booking().await).await;
    h.clock.advance(Duration::seconds(3));
    h.engine
        .handle_driver_response(accept(request_id, first))
        .await
        .unwrap();

    // declined by the only free driver after 2s
    let request_id = start(&h, h.pending_booking().await).await;
    h.clock.advance(Duration::seconds(2));
    h.engine
        .handle_driver_response(decline(request_id, second))
        .await
        .unwrap();

    let request_id = start(&h, h.pending_booking().await).await;
    h.engine
        .cancel_dispatch(request_id, h.tenant_id)
        .await
        .unwrap();

    // nobody answers within 30s
    let request_id = start(&h, h.pending_booking().await).await;
    h.clock.advance(Duration::seconds(31));
    h.engine.sweep_expired(h.clock.now()).await.unwrap();

    // a late reply changes nothing
    h.engine
        .handle_driver_response(accept(request_id, second))
        .await
        .unwrap();

    let stats = h.engine.dispatch_stats(h.tenant_id).await.unwrap();

    assert_eq!(stats.total_requests, 4);
    assert_eq!(stats.successful_assignments, 1);
    assert_eq!(stats.failed_assignments, 2);
    assert_eq!(stats.cancelled, 1);
    assert_eq!(stats.acceptance_rate, 0.25);
    assert_eq!(stats.average_search_ms, 12_000.0);

    assert_eq!(
        h.engine.dispatch_stats(Uuid::new_v4()).await.unwrap(),
        DispatchStats::default()
    );
}

#[tokio::test]
async fn pending_requests_are_listed_per_tenant() {
    let h = harness();
    let first = h.add_driver(1.0).await;
    h.add_driver(2.0).await;

    let answered = start(&h, h.pending_booking().await).await;
    h.clock.advance(Duration::seconds(1));
    let waiting = start(&h, h.pending_booking().await).await;

    h.engine
        .handle_driver_response(accept(answered, first))
        .await
        .unwrap();

    let pending = h.engine.pending_requests(h.tenant_id).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].request_id, waiting);
    assert_eq!(pending[0].status, "searching");

    assert!(h
        .engine
        .pending_requests(Uuid::new_v4())
        .await
        .unwrap()
        .is_empty());
}
