//! Load simulation: a fleet of simulated drivers racing to answer a stream of
//! bookings, all against the in-memory collaborators.

use async_channel::{Receiver, Sender};
use chrono::Utc;
use rand_distr::{Bernoulli, Distribution, Normal, Uniform};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::api::{BookingAPI, DispatchAPI};
use crate::engine::Engine;
use crate::entities::{
    Booking, BookingStatus, Coordinates, DispatchOutcome, DriverCandidate, DriverResponse,
    ResponseOutcome, StartDispatch,
};
use crate::error::{upstream_error, Error};
use crate::external::memory::{MemoryBookingStore, MemoryDriverPool};
use crate::geo;
use crate::store::{DispatchRequestStore, InMemoryRequestStore};

const KM_PER_DEGREE: f64 = 111.32;

#[derive(Clone, Debug)]
pub struct Settings {
    pub drivers: usize,
    pub bookings: usize,
    pub dispatch_workers: usize,
    pub response_workers: usize,
    /// Standard deviation, in km, of driver and pickup positions around the
    /// city centre.
    pub spread_km: f64,
    pub accept_probability: f64,
    /// Upper bound of the simulated time a driver takes to tap a button.
    pub max_reaction_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            drivers: 40,
            bookings: 100,
            dispatch_workers: 4,
            response_workers: 16,
            spread_km: 3.0,
            accept_probability: 0.3,
            max_reaction_ms: 50,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Report {
    pub dispatched: usize,
    pub no_eligible_drivers: usize,
    pub assigned: usize,
    pub completed: usize,
    pub all_declined: usize,
    pub lost_races: usize,
    pub driver_unavailable: usize,
    pub expired: usize,
}

struct Shared {
    engine: Arc<Engine>,
    store: Arc<InMemoryRequestStore>,
    pool: Arc<MemoryDriverPool>,
    bookings: Arc<MemoryBookingStore>,
    tenant_id: Uuid,
    centre: Coordinates,
    settings: Settings,
    report: Mutex<Report>,
}

pub struct Executor {
    s: Arc<Shared>,
}

impl Executor {
    pub fn new(
        engine: Arc<Engine>,
        store: Arc<InMemoryRequestStore>,
        pool: Arc<MemoryDriverPool>,
        bookings: Arc<MemoryBookingStore>,
        settings: Settings,
    ) -> Self {
        Self {
            s: Arc::new(Shared {
                engine,
                store,
                pool,
                bookings,
                tenant_id: Uuid::new_v4(),
                centre: Coordinates::new(48.8566, 2.3522),
                settings,
                report: Mutex::new(Report::default()),
            }),
        }
    }

    #[tracing::instrument(name = "Executor::run", skip(self))]
    pub async fn run(&self) -> Result<Report, Error> {
        self.seed_drivers().await?;

        let (booking_tx, booking_rx): (Sender<()>, Receiver<()>) = async_channel::unbounded();
        let (response_tx, response_rx): (Sender<(Uuid, Uuid)>, Receiver<(Uuid, Uuid)>) =
            async_channel::unbounded();

        let mut dispatchers = vec![];
        for _ in 0..self.s.settings.dispatch_workers.max(1) {
            let s = self.s.clone();
            let rx = booking_rx.clone();
            let tx = response_tx.clone();

            dispatchers.push(tokio::spawn(async move {
                while rx.recv().await.is_ok() {
                    s.dispatch_one(&tx).await?;
                }

                Ok::<(), Error>(())
            }));
        }

        let mut responders = vec![];
        for _ in 0..self.s.settings.response_workers.max(1) {
            let s = self.s.clone();
            let rx = response_rx.clone();

            responders.push(tokio::spawn(async move {
                while let Ok((request_id, driver_id)) = rx.recv().await {
                    s.respond(request_id, driver_id).await?;
                }

                Ok::<(), Error>(())
            }));
        }

        // responders stop once every dispatcher has dropped its sender
        drop(response_tx);

        for _ in 0..self.s.settings.bookings {
            booking_tx.send(()).await.map_err(upstream_error)?;
        }
        booking_tx.close();

        for handle in dispatchers {
            handle.await.map_err(upstream_error)??;
        }

        for handle in responders {
            handle.await.map_err(upstream_error)??;
        }

        // whatever is still searching would have timed out by now
        let horizon = Utc::now() + self.s.engine.config().driver_response_timeout();
        let expired = self.s.engine.sweep_expired(horizon).await?;

        let mut report = self.s.report.lock().await;
        report.expired += expired.len();

        tracing::info!(?report, "simulation finished");

        Ok(report.clone())
    }

    #[tracing::instrument(skip(self))]
    async fn seed_drivers(&self) -> Result<(), Error> {
        let ratings = Uniform::new_inclusive(3.5, 5.0);

        for _ in 0..self.s.settings.drivers {
            let position = self.s.sample_position()?;
            let rating = ratings.sample(&mut rand::thread_rng());

            let driver = DriverCandidate::new(self.s.tenant_id, "standard", Some(position))
                .with_rating(rating);

            self.s.pool.upsert(driver).await;
        }

        tracing::info!(drivers = self.s.settings.drivers, "seeded drivers");

        Ok(())
    }
}

impl Shared {
    fn sample_position(&self) -> Result<Coordinates, Error> {
        let spread = Normal::new(0.0, self.settings.spread_km).map_err(upstream_error)?;
        let mut rng = rand::thread_rng();

        let north_km = spread.sample(&mut rng);
        let east_km = spread.sample(&mut rng);

        let shifted = geo::offset_north(self.centre, north_km);
        let lng_per_km = 1.0 / (KM_PER_DEGREE * shifted.lat.to_radians().cos());

        Ok(Coordinates::new(shifted.lat, shifted.lng + east_km * lng_per_km))
    }

    fn sample_reaction(&self) -> Result<(bool, Duration), Error> {
        let decision = Bernoulli::new(self.accept_probability()).map_err(upstream_error)?;
        let reaction = Uniform::new_inclusive(0, self.settings.max_reaction_ms);
        let mut rng = rand::thread_rng();

        Ok((
            decision.sample(&mut rng),
            Duration::from_millis(reaction.sample(&mut rng)),
        ))
    }

    fn accept_probability(&self) -> f64 {
        self.settings.accept_probability.clamp(0.0, 1.0)
    }

    async fn dispatch_one(&self, responses: &Sender<(Uuid, Uuid)>) -> Result<(), Error> {
        let booking = Booking::new(self.tenant_id, Some(20.0));
        let booking_id = booking.id;
        self.bookings.insert(booking).await;

        let pickup = self.sample_position()?;
        let outcome = self
            .engine
            .start_dispatch(StartDispatch::new(booking_id, self.tenant_id, pickup))
            .await?;

        let request_id = match outcome {
            DispatchOutcome::Searching { request_id, .. } => request_id,
            _ => {
                tracing::info!(%booking_id, "no eligible drivers");
                self.report.lock().await.no_eligible_drivers += 1;
                return Ok(());
            }
        };

        self.report.lock().await.dispatched += 1;

        // the request can already be gone if a response raced ahead
        let notified: Vec<Uuid> = match self.store.get(request_id).await {
            Some(request) => request.notified_ids().collect(),
            None => vec![],
        };

        for driver_id in notified {
            responses
                .send((request_id, driver_id))
                .await
                .map_err(upstream_error)?;
        }

        Ok(())
    }

    async fn respond(&self, request_id: Uuid, driver_id: Uuid) -> Result<(), Error> {
        let (accepted, reaction) = self.sample_reaction()?;
        tokio::time::sleep(reaction).await;

        let outcome = self
            .engine
            .handle_driver_response(DriverResponse {
                request_id,
                driver_id,
                accepted,
                decline_reason: (!accepted).then(|| "busy".to_string()),
            })
            .await?;

        tracing::info!(%request_id, %driver_id, ?outcome, "driver responded");

        match outcome {
            ResponseOutcome::Assigned { driver_id } => {
                self.report.lock().await.assigned += 1;
                self.drive(request_id, driver_id).await?;
            }
            ResponseOutcome::AllDeclined => self.report.lock().await.all_declined += 1,
            ResponseOutcome::AlreadyAssigned => self.report.lock().await.lost_races += 1,
            ResponseOutcome::DriverUnavailable => {
                self.report.lock().await.driver_unavailable += 1
            }
            _ => {}
        }

        Ok(())
    }

    /// Plays the trip through to completion so the driver rejoins the pool.
    async fn drive(&self, request_id: Uuid, driver_id: Uuid) -> Result<(), Error> {
        let status = self
            .engine
            .dispatch_status(request_id, self.tenant_id)
            .await?;

        for next in [
            BookingStatus::EnRoute,
            BookingStatus::Arrived,
            BookingStatus::InProgress,
            BookingStatus::Completed,
        ] {
            self.engine
                .advance_booking(status.booking_id, driver_id, next)
                .await?;
        }

        self.report.lock().await.completed += 1;

        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn simulation_accounts_for_every_booking() {
    use crate::clock::SystemClock;
    use crate::config::Config;
    use crate::engine::Collaborators;
    use crate::external::memory::RecordingGateway;

    let clock = Arc::new(SystemClock);
    let store = Arc::new(InMemoryRequestStore::new(clock.clone()));
    let pool = Arc::new(MemoryDriverPool::new());
    let bookings = Arc::new(MemoryBookingStore::new());

    let collaborators = Collaborators {
        drivers: pool.clone(),
        driver_status: pool.clone(),
        bookings: bookings.clone(),
        notifier: Arc::new(RecordingGateway::new()),
    };

    let engine = Engine::new(Config::default(), clock, store.clone(), collaborators).unwrap();

    let settings = Settings {
        drivers: 10,
        bookings: 20,
        max_reaction_ms: 5,
        ..Settings::default()
    };

    let report = Executor::new(Arc::new(engine), store.clone(), pool.clone(), bookings, settings)
        .run()
        .await
        .unwrap();

    assert_eq!(report.dispatched + report.no_eligible_drivers, 20);
    assert_eq!(report.assigned, report.completed);
    assert!(report.assigned + report.all_declined + report.expired <= report.dispatched);
    assert_eq!(store.live_count().await, 0);

    // every completed trip handed its driver back
    for driver in pool.all().await {
        assert!(driver.available);
    }
}
