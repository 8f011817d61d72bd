//! Registry of outstanding dispatch attempts.
//!
//! Every method takes the store lock exactly once, so each call is atomic with
//! respect to every other call. `try_resolve` is the only path that writes a
//! winner.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::clock::Clock;
use crate::entities::{
    DeclineProgress, DispatchRequest, DispatchStatus, FailureReason, Resolution, ResolveRejection,
};
use crate::error::{not_found_error, tenant_mismatch_error, Error};

#[async_trait]
pub trait DispatchRequestStore: Send + Sync {
    async fn create(&self, request: DispatchRequest) -> Uuid;

    /// Live (not yet deleted) request, whatever its resolution.
    async fn get(&self, id: Uuid) -> Option<DispatchRequest>;

    /// Live request still searching on behalf of `booking_id`, if any.
    async fn searching_for_booking(&self, booking_id: Uuid) -> Option<DispatchRequest>;

    /// Would `try_resolve` let this driver win right now? Never mutates.
    async fn check_eligible(&self, id: Uuid, driver_id: Uuid) -> Result<(), ResolveRejection>;

    /// Compare-and-set from `Searching` to `Assigned { driver_id }`.
    async fn try_resolve(
        &self,
        id: Uuid,
        driver_id: Uuid,
    ) -> Result<DispatchRequest, ResolveRejection>;

    /// Records a decline; marks the request `Failed(AllDeclined)` when nobody
    /// is left.
    async fn record_decline(
        &self,
        id: Uuid,
        driver_id: Uuid,
    ) -> Result<DeclineProgress, ResolveRejection>;

    /// Compare-and-set from `Searching` to `Failed { reason }`.
    async fn fail(&self, id: Uuid, reason: FailureReason) -> Option<DispatchRequest>;

    /// Atomically checks ownership, marks the request `Cancelled` and deletes it.
    async fn cancel(&self, id: Uuid, tenant_id: Uuid) -> Result<DispatchRequest, Error>;

    /// Removes a request from the live set. Its final state stays answerable
    /// for late replies until purged.
    async fn delete(&self, id: Uuid) -> Option<DispatchRequest>;

    /// Marks every `Searching` request whose expiry is before `now` as
    /// `Failed(Expired)` and returns them.
    async fn expire_older_than(&self, now: DateTime<Utc>) -> Vec<DispatchRequest>;

    /// Forgets deleted requests retired before `cutoff`.
    async fn purge_deleted(&self, cutoff: DateTime<Utc>) -> usize;

    async fn status(&self, id: Uuid) -> Option<DispatchStatus>;

    /// The tenant's requests that drivers can still answer, oldest first.
    async fn pending(&self, tenant_id: Uuid) -> Vec<DispatchStatus>;
}

#[derive(Default)]
struct Inner {
    live: HashMap<Uuid, DispatchRequest>,
    retired: HashMap<Uuid, (DispatchRequest, DateTime<Utc>)>,
}

impl Inner {
    fn lookup(&self, id: &Uuid) -> Option<&DispatchRequest> {
        self.live
            .get(id)
            .or_else(|| self.retired.get(id).map(|(request, _)| request))
    }
}

pub struct InMemoryRequestStore {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
}

impl InMemoryRequestStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            clock,
        }
    }

    pub async fn live_count(&self) -> usize {
        self.inner.lock().await.live.len()
    }
}

/// Decides whether `driver_id` may still act on `request` at `now`.
fn evaluate(
    request: &DispatchRequest,
    driver_id: Uuid,
    now: DateTime<Utc>,
) -> Result<(), ResolveRejection> {
    if !request.was_notified(driver_id) {
        return Err(ResolveRejection::DriverNotEligible);
    }

    match request.resolution {
        Resolution::Searching => {}
        Resolution::Assigned { driver_id: _ } => return Err(ResolveRejection::AlreadyAssigned),
        Resolution::Failed {
            reason: FailureReason::Expired,
        } => return Err(ResolveRejection::Expired),
        Resolution::Failed {
            reason: FailureReason::AllDeclined,
        }
        | Resolution::Cancelled => return Err(ResolveRejection::RequestClosed),
    }

    if request.declined.contains(&driver_id) {
        return Err(ResolveRejection::DriverNotEligible);
    }

    // wall-clock check; does not depend on the sweep having run
    if request.is_expired_at(now) {
        return Err(ResolveRejection::Expired);
    }

    Ok(())
}

#[async_trait]
impl DispatchRequestStore for InMemoryRequestStore {
    #[tracing::instrument(skip(self, request), fields(request_id = %request.id))]
    async fn create(&self, request: DispatchRequest) -> Uuid {
        let id = request.id;
        self.inner.lock().await.live.insert(id, request);
        id
    }

    async fn get(&self, id: Uuid) -> Option<DispatchRequest> {
        self.inner.lock().await.live.get(&id).cloned()
    }

    async fn searching_for_booking(&self, booking_id: Uuid) -> Option<DispatchRequest> {
        self.inner
            .lock()
            .await
            .live
            .values()
            .find(|request| request.booking_id == booking_id && request.is_searching())
            .cloned()
    }

    async fn check_eligible(&self, id: Uuid, driver_id: Uuid) -> Result<(), ResolveRejection> {
        let now = self.clock.now();
        let inner = self.inner.lock().await;

        let request = inner
            .lookup(&id)
            .ok_or(ResolveRejection::UnknownRequest)?;

        evaluate(request, driver_id, now)
    }

    #[tracing::instrument(skip(self))]
    async fn try_resolve(
        &self,
        id: Uuid,
        driver_id: Uuid,
    ) -> Result<DispatchRequest, ResolveRejection> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;

        let request = match inner.live.get_mut(&id) {
            Some(request) => request,
            None => {
                let request = inner
                    .lookup(&id)
                    .ok_or(ResolveRejection::UnknownRequest)?;
                evaluate(request, driver_id, now)?;

                // a retired request never passes evaluation
                return Err(ResolveRejection::RequestClosed);
            }
        };

        evaluate(request, driver_id, now)?;

        request.resolution = Resolution::Assigned { driver_id };

        tracing::info!("request resolved");

        Ok(request.clone())
    }

    #[tracing::instrument(skip(self))]
    async fn record_decline(
        &self,
        id: Uuid,
        driver_id: Uuid,
    ) -> Result<DeclineProgress, ResolveRejection> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;

        let request = match inner.live.get_mut(&id) {
            Some(request) => request,
            None => {
                let request = inner
                    .lookup(&id)
                    .ok_or(ResolveRejection::UnknownRequest)?;
                evaluate(request, driver_id, now)?;
                return Err(ResolveRejection::RequestClosed);
            }
        };

        evaluate(request, driver_id, now)?;

        request.declined.insert(driver_id);

        let remaining = request.remaining();
        if remaining > 0 {
            return Ok(DeclineProgress::Waiting { remaining });
        }

        request.resolution = Resolution::Failed {
            reason: FailureReason::AllDeclined,
        };

        tracing::info!("every notified driver declined");

        Ok(DeclineProgress::AllDeclined(request.clone()))
    }

    #[tracing::instrument(skip(self))]
    async fn fail(&self, id: Uuid, reason: FailureReason) -> Option<DispatchRequest> {
        let mut inner = self.inner.lock().await;
        let request = inner.live.get_mut(&id)?;

        if !request.is_searching() {
            return None;
        }

        request.resolution = Resolution::Failed { reason };

        Some(request.clone())
    }

    #[tracing::instrument(skip(self))]
    async fn cancel(&self, id: Uuid, tenant_id: Uuid) -> Result<DispatchRequest, Error> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;

        let request = inner.live.get(&id).ok_or_else(not_found_error)?;

        if request.tenant_id != tenant_id {
            return Err(tenant_mismatch_error());
        }

        if !request.is_searching() {
            return Err(not_found_error());
        }

        let mut request = inner.live.remove(&id).ok_or_else(not_found_error)?;
        request.resolution = Resolution::Cancelled;
        inner.retired.insert(id, (request.clone(), now));

        Ok(request)
    }

    #[tracing::instrument(skip(self))]
    async fn delete(&self, id: Uuid) -> Option<DispatchRequest> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;

        let request = inner.live.remove(&id)?;
        inner.retired.insert(id, (request.clone(), now));

        Some(request)
    }

    #[tracing::instrument(skip(self))]
    async fn expire_older_than(&self, now: DateTime<Utc>) -> Vec<DispatchRequest> {
        let mut inner = self.inner.lock().await;

        let mut expired = vec![];

        for request in inner.live.values_mut() {
            if request.is_searching() && request.is_expired_at(now) {
                request.resolution = Resolution::Failed {
                    reason: FailureReason::Expired,
                };
                expired.push(request.clone());
            }
        }

        expired
    }

    async fn purge_deleted(&self, cutoff: DateTime<Utc>) -> usize {
        let mut inner = self.inner.lock().await;

        let before = inner.retired.len();
        inner.retired.retain(|_, (_, retired_at)| *retired_at >= cutoff);

        before - inner.retired.len()
    }

    async fn status(&self, id: Uuid) -> Option<DispatchStatus> {
        let now = self.clock.now();
        let inner = self.inner.lock().await;

        inner
            .lookup(&id)
            .map(|request| DispatchStatus::of(request, now))
    }

    async fn pending(&self, tenant_id: Uuid) -> Vec<DispatchStatus> {
        let now = self.clock.now();
        let inner = self.inner.lock().await;

        let mut pending: Vec<&DispatchRequest> = inner
            .live
            .values()
            .filter(|request| request.tenant_id == tenant_id)
            .filter(|request| request.is_searching() && !request.is_expired_at(now))
            .collect();

        pending.sort_by_key(|request| (request.created_at, request.id));

        pending
            .into_iter()
            .map(|request| DispatchStatus::of(request, now))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::entities::{Coordinates, NotifiedDriver};
    use chrono::Duration;
    use tokio_test::block_on;

    fn setup(drivers: &[Uuid]) -> (Arc<ManualClock>, InMemoryRequestStore, DispatchRequest) {
        let clock = Arc::new(ManualClock::default());
        let store = InMemoryRequestStore::new(clock.clone());

        let notified = drivers
            .iter()
            .map(|&driver_id| NotifiedDriver {
                driver_id,
                distance_km: 1.0,
                eta_minutes: 2,
            })
            .collect();

        let request = DispatchRequest::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Coordinates::new(48.85, 2.35),
            Some("standard".into()),
            notified,
            clock.now(),
            Duration::seconds(30),
        );

        (clock, store, request)
    }

    #[test]
    fn first_eligible_driver_wins() {
        let (d1, d2) = (Uuid::new_v4(), Uuid::new_v4());
        let (_, store, request) = setup(&[d1, d2]);
        let id = block_on(store.create(request));

        let won = block_on(store.try_resolve(id, d2)).unwrap();
        assert_eq!(won.winner(), Some(d2));

        assert_eq!(
            block_on(store.try_resolve(id, d1)).unwrap_err(),
            ResolveRejection::AlreadyAssigned
        );
    }

    #[test]
    fn unnotified_driver_is_never_eligible() {
        let d1 = Uuid::new_v4();
        let (clock, store, request) = setup(&[d1]);
        let id = block_on(store.create(request));
        let stranger = Uuid::new_v4();

        assert_eq!(
            block_on(store.try_resolve(id, stranger)).unwrap_err(),
            ResolveRejection::DriverNotEligible
        );

        block_on(store.try_resolve(id, d1)).unwrap();
        assert_eq!(
            block_on(store.try_resolve(id, stranger)).unwrap_err(),
            ResolveRejection::DriverNotEligible
        );

        clock.advance(Duration::minutes(5));
        block_on(store.delete(id));
        assert_eq!(
            block_on(store.try_resolve(id, stranger)).unwrap_err(),
            ResolveRejection::DriverNotEligible
        );
    }

    #[test]
    fn expiry_is_checked_against_the_clock_before_any_sweep() {
        let d1 = Uuid::new_v4();
        let (clock, store, request) = setup(&[d1]);
        let id = block_on(store.create(request));

        clock.advance(Duration::seconds(31));

        assert_eq!(
            block_on(store.try_resolve(id, d1)).unwrap_err(),
            ResolveRejection::Expired
        );
        // no mutation: the sweep still sees it as newly expired
        assert_eq!(block_on(store.expire_older_than(clock.now())).len(), 1);
    }

    #[test]
    fn expired_requests_stay_expired_after_delete() {
        let d1 = Uuid::new_v4();
        let (clock, store, request) = setup(&[d1]);
        let id = block_on(store.create(request));

        clock.advance(Duration::seconds(31));
        let expired = block_on(store.expire_older_than(clock.now()));
        assert_eq!(expired.len(), 1);
        assert!(block_on(store.expire_older_than(clock.now())).is_empty());

        block_on(store.delete(id));
        assert!(block_on(store.get(id)).is_none());
        assert_eq!(
            block_on(store.try_resolve(id, d1)).unwrap_err(),
            ResolveRejection::Expired
        );
    }

    #[test]
    fn declines_until_nobody_is_left() {
        let (d1, d2) = (Uuid::new_v4(), Uuid::new_v4());
        let (_, store, request) = setup(&[d1, d2]);
        let id = block_on(store.create(request));

        match block_on(store.record_decline(id, d1)).unwrap() {
            DeclineProgress::Waiting { remaining } => assert_eq!(remaining, 1),
            other => panic!("unexpected {:?}", other),
        }

        // a decliner cannot come back and accept
        assert_eq!(
            block_on(store.try_resolve(id, d1)).unwrap_err(),
            ResolveRejection::DriverNotEligible
        );

        match block_on(store.record_decline(id, d2)).unwrap() {
            DeclineProgress::AllDeclined(request) => assert_eq!(
                request.resolution,
                Resolution::Failed {
                    reason: FailureReason::AllDeclined
                }
            ),
            other => panic!("unexpected {:?}", other),
        }

        assert_eq!(
            block_on(store.record_decline(id, d2)).unwrap_err(),
            ResolveRejection::RequestClosed
        );
    }

    #[test]
    fn fail_only_applies_to_searching_requests() {
        let d1 = Uuid::new_v4();
        let (_, store, request) = setup(&[d1]);
        let id = block_on(store.create(request));

        block_on(store.try_resolve(id, d1)).unwrap();

        assert!(block_on(store.fail(id, FailureReason::Expired)).is_none());
        assert_eq!(block_on(store.get(id)).unwrap().winner(), Some(d1));
    }

    #[test]
    fn cancel_checks_tenant_and_state() {
        let d1 = Uuid::new_v4();
        let (_, store, request) = setup(&[d1]);
        let tenant_id = request.tenant_id;
        let id = block_on(store.create(request));

        assert!(block_on(store.cancel(id, Uuid::new_v4()))
            .unwrap_err()
            .is_tenant_mismatch_error());

        let cancelled = block_on(store.cancel(id, tenant_id)).unwrap();
        assert_eq!(cancelled.resolution, Resolution::Cancelled);

        assert!(block_on(store.cancel(id, tenant_id))
            .unwrap_err()
            .is_not_found_error());
        assert_eq!(
            block_on(store.try_resolve(id, d1)).unwrap_err(),
            ResolveRejection::RequestClosed
        );
    }

    #[test]
    fn cancel_after_resolution_is_not_found() {
        let d1 = Uuid::new_v4();
        let (_, store, request) = setup(&[d1]);
        let tenant_id = request.tenant_id;
        let id = block_on(store.create(request));

        block_on(store.try_resolve(id, d1)).unwrap();

        assert!(block_on(store.cancel(id, tenant_id))
            .unwrap_err()
            .is_not_found_error());
    }

    #[test]
    fn purge_forgets_old_retired_requests() {
        let d1 = Uuid::new_v4();
        let (clock, store, request) = setup(&[d1]);
        let id = block_on(store.create(request));

        block_on(store.try_resolve(id, d1)).unwrap();
        block_on(store.delete(id));
        assert!(block_on(store.status(id)).is_some());

        clock.advance(Duration::minutes(11));
        let purged = block_on(store.purge_deleted(clock.now() - Duration::minutes(10)));

        assert_eq!(purged, 1);
        assert!(block_on(store.status(id)).is_none());
        assert_eq!(
            block_on(store.try_resolve(id, d1)).unwrap_err(),
            ResolveRejection::UnknownRequest
        );
    }

    #[test]
    fn pending_lists_open_requests_of_one_tenant() {
        let d1 = Uuid::new_v4();
        let (clock, store, first) = setup(&[d1]);
        let tenant_id = first.tenant_id;
        let first_id = block_on(store.create(first));

        clock.advance(Duration::seconds(5));
        let second_id = block_on(store.create(request_for(tenant_id, d1, clock.now())));
        block_on(store.create(request_for(Uuid::new_v4(), d1, clock.now())));

        let ids: Vec<Uuid> = block_on(store.pending(tenant_id))
            .iter()
            .map(|status| status.request_id)
            .collect();
        assert_eq!(ids, vec![first_id, second_id]);

        block_on(store.try_resolve(second_id, d1)).unwrap();

        // the first one is past its deadline even though no sweep ran
        clock.advance(Duration::seconds(26));
        assert!(block_on(store.pending(tenant_id)).is_empty());
    }

    fn request_for(
        tenant_id: Uuid,
        driver_id: Uuid,
        now: DateTime<Utc>,
    ) -> DispatchRequest {
        DispatchRequest::new(
            Uuid::new_v4(),
            tenant_id,
            Coordinates::new(48.85, 2.35),
            Some("standard".into()),
            vec![NotifiedDriver {
                driver_id,
                distance_km: 1.0,
                eta_minutes: 2,
            }],
            now,
            Duration::seconds(30),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_resolution_has_one_winner() {
        let drivers: Vec<Uuid> = (0..16).map(|_| Uuid::new_v4()).collect();
        let (_, store, request) = setup(&drivers);
        let store = Arc::new(store);
        let id = store.create(request).await;

        let handles: Vec<_> = drivers
            .iter()
            .map(|&driver_id| {
                let store = store.clone();
                tokio::spawn(async move { store.try_resolve(id, driver_id).await })
            })
            .collect();

        let mut winners = 0;
        for result in futures::future::join_all(handles).await {
            match result.unwrap() {
                Ok(_) => winners += 1,
                Err(rejection) => assert_eq!(rejection, ResolveRejection::AlreadyAssigned),
            }
        }

        assert_eq!(winners, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_last_declines_close_the_request_once() {
        let drivers: Vec<Uuid> = (0..16).map(|_| Uuid::new_v4()).collect();
        let (_, store, request) = setup(&drivers);
        let store = Arc::new(store);
        let id = store.create(request).await;

        let handles: Vec<_> = drivers
            .iter()
            .map(|&driver_id| {
                let store = store.clone();
                tokio::spawn(async move { store.record_decline(id, driver_id).await })
            })
            .collect();

        let mut closed = 0;
        let mut waiting = vec![];
        for result in futures::future::join_all(handles).await {
            match result.unwrap().unwrap() {
                DeclineProgress::AllDeclined(_) => closed += 1,
                DeclineProgress::Waiting { remaining } => waiting.push(remaining),
            }
        }

        assert_eq!(closed, 1);
        // every remaining count from 15 down to 1 was handed out exactly once
        waiting.sort_unstable();
        assert_eq!(waiting, (1..16).collect::<Vec<usize>>());
    }
}
