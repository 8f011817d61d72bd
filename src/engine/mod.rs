mod booking_api;
mod dispatch_api;
mod helpers;
mod stats;
pub mod sweeper;

use std::sync::Arc;

use self::stats::Counters;
use crate::{
    api::API,
    clock::Clock,
    config::Config,
    error::Error,
    external::{BookingStore, DriverPool, DriverStatusStore, NotificationGateway},
    store::DispatchRequestStore,
};

/// Handles to the systems the engine reads from and writes to.
#[derive(Clone)]
pub struct Collaborators {
    pub drivers: Arc<dyn DriverPool>,
    pub driver_status: Arc<dyn DriverStatusStore>,
    pub bookings: Arc<dyn BookingStore>,
    pub notifier: Arc<dyn NotificationGateway>,
}

pub struct Engine {
    config: Config,
    clock: Arc<dyn Clock>,
    store: Arc<dyn DispatchRequestStore>,
    drivers: Arc<dyn DriverPool>,
    driver_status: Arc<dyn DriverStatusStore>,
    bookings: Arc<dyn BookingStore>,
    notifier: Arc<dyn NotificationGateway>,
    stats: Counters,
}

impl Engine {
    #[tracing::instrument(name = "Engine::new", skip_all)]
    pub fn new(
        config: Config,
        clock: Arc<dyn Clock>,
        store: Arc<dyn DispatchRequestStore>,
        collaborators: Collaborators,
    ) -> Result<Self, Error> {
        config.validate()?;

        Ok(Self {
            config,
            clock,
            store,
            drivers: collaborators.drivers,
            driver_status: collaborators.driver_status,
            bookings: collaborators.bookings,
            notifier: collaborators.notifier,
            stats: Counters::default(),
        })
    }
}

impl API for Engine {}

#[cfg(test)]
pub(crate) mod testing {
    use std::time::Duration as StdDuration;

    use super::*;
    use crate::clock::ManualClock;
    use crate::entities::{Booking, Coordinates, DriverCandidate, Event};
    use crate::external::memory::{MemoryBookingStore, MemoryDriverPool, RecordingGateway};
    use crate::geo::offset_north;
    use crate::store::InMemoryRequestStore;
    use uuid::Uuid;

    pub fn pickup() -> Coordinates {
        Coordinates::new(48.8566, 2.3522)
    }

    pub struct Harness {
        pub engine: Arc<Engine>,
        pub clock: Arc<ManualClock>,
        pub store: Arc<InMemoryRequestStore>,
        pub pool: Arc<MemoryDriverPool>,
        pub bookings: Arc<MemoryBookingStore>,
        pub gateway: Arc<RecordingGateway>,
        pub tenant_id: Uuid,
    }

    pub fn harness() -> Harness {
        harness_with(Config::default(), RecordingGateway::new())
    }

    pub fn harness_with(config: Config, gateway: RecordingGateway) -> Harness {
        harness_wrapping(config, gateway, |bookings| bookings as Arc<dyn BookingStore>)
    }

    /// Like `harness_with`, but the engine reaches the booking store through
    /// whatever `wrap` puts in front of it.
    pub fn harness_wrapping(
        config: Config,
        gateway: RecordingGateway,
        wrap: impl FnOnce(Arc<MemoryBookingStore>) -> Arc<dyn BookingStore>,
    ) -> Harness {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(InMemoryRequestStore::new(clock.clone()));
        let pool = Arc::new(MemoryDriverPool::new());
        let bookings = Arc::new(MemoryBookingStore::new());
        let gateway = Arc::new(gateway);

        let collaborators = Collaborators {
            drivers: pool.clone(),
            driver_status: pool.clone(),
            bookings: wrap(bookings.clone()),
            notifier: gateway.clone(),
        };

        let engine = Engine::new(config, clock.clone(), store.clone(), collaborators).unwrap();

        Harness {
            engine: Arc::new(engine),
            clock,
            store,
            pool,
            bookings,
            gateway,
            tenant_id: Uuid::new_v4(),
        }
    }

    impl Harness {
        /// Adds an available standard driver `km` north of the pickup.
        pub async fn add_driver(&self, km: f64) -> Uuid {
            self.add_driver_as(Uuid::new_v4(), km).await
        }

        pub async fn add_driver_as(&self, id: Uuid, km: f64) -> Uuid {
            let mut driver =
                DriverCandidate::new(self.tenant_id, "standard", Some(offset_north(pickup(), km)));
            driver.id = id;
            self.pool.upsert(driver).await;
            id
        }

        pub async fn pending_booking(&self) -> Uuid {
            let booking = Booking::new(self.tenant_id, Some(18.5));
            let id = booking.id;
            self.bookings.insert(booking).await;
            id
        }

        pub async fn booking(&self, id: Uuid) -> Booking {
            self.bookings.get(id).await.unwrap()
        }

        /// Waits for spawned fan-out tasks to deliver `count` events of a kind.
        pub async fn wait_for(&self, event: Event, count: usize) {
            let waiting = async {
                while self.gateway.count(event) < count {
                    tokio::time::sleep(StdDuration::from_millis(5)).await;
                }
            };

            tokio::time::timeout(StdDuration::from_secs(2), waiting)
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {} x {}", count, event));
        }
    }
}
