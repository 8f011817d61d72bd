use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{BookingStore, DriverPool, DriverStatusStore, NotificationGateway};
use crate::entities::{Booking, BookingStatus, DriverCandidate, Event, StatusChange};
use crate::error::{
    driver_unavailable_error, not_found_error, stale_write_error, upstream_error, Error,
};

#[derive(Debug, Default)]
pub struct MemoryDriverPool {
    drivers: RwLock<HashMap<Uuid, DriverCandidate>>,
}

impl MemoryDriverPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert(&self, driver: DriverCandidate) {
        self.drivers.write().await.insert(driver.id, driver);
    }

    pub async fn find(&self, driver_id: Uuid) -> Option<DriverCandidate> {
        self.drivers.read().await.get(&driver_id).cloned()
    }

    pub async fn is_available(&self, driver_id: Uuid) -> bool {
        self.find(driver_id)
            .await
            .map(|driver| driver.available)
            .unwrap_or(false)
    }

    pub async fn all(&self) -> Vec<DriverCandidate> {
        self.drivers.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl DriverPool for MemoryDriverPool {
    async fn list_available(
        &self,
        tenant_id: Uuid,
        vehicle_type: Option<&str>,
    ) -> Result<Vec<DriverCandidate>, Error> {
        let drivers = self.drivers.read().await;

        let mut available: Vec<DriverCandidate> = drivers
            .values()
            .filter(|driver| driver.tenant_id == tenant_id && driver.available)
            .filter(|driver| match vehicle_type {
                Some(vehicle_type) => driver.vehicle_type == vehicle_type,
                None => true,
            })
            .cloned()
            .collect();

        // HashMap order is arbitrary; keep snapshots stable
        available.sort_by_key(|driver| driver.id);

        Ok(available)
    }
}

#[async_trait]
impl DriverStatusStore for MemoryDriverPool {
    #[tracing::instrument(skip(self))]
    async fn set_busy(&self, driver_id: Uuid) -> Result<(), Error> {
        let mut drivers = self.drivers.write().await;
        let driver = drivers.get_mut(&driver_id).ok_or_else(not_found_error)?;

        if !driver.available {
            return Err(driver_unavailable_error());
        }

        driver.available = false;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn set_available(&self, driver_id: Uuid) -> Result<(), Error> {
        let mut drivers = self.drivers.write().await;
        let driver = drivers.get_mut(&driver_id).ok_or_else(not_found_error)?;

        driver.available = true;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryBookingStore {
    bookings: RwLock<HashMap<Uuid, Booking>>,
}

impl MemoryBookingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, booking: Booking) {
        self.bookings.write().await.insert(booking.id, booking);
    }
}

#[async_trait]
impl BookingStore for MemoryBookingStore {
    async fn get(&self, booking_id: Uuid) -> Result<Booking, Error> {
        self.bookings
            .read()
            .await
            .get(&booking_id)
            .cloned()
            .ok_or_else(not_found_error)
    }

    #[tracing::instrument(skip(self))]
    async fn set_status(
        &self,
        booking_id: Uuid,
        expected: BookingStatus,
        status: BookingStatus,
        driver_id: Option<Uuid>,
    ) -> Result<(), Error> {
        let mut bookings = self.bookings.write().await;
        let booking = bookings.get_mut(&booking_id).ok_or_else(not_found_error)?;

        if booking.status != expected {
            tracing::info!(current = ?booking.status, "stale booking write rejected");
            return Err(stale_write_error());
        }

        booking.status = status;
        booking.assigned_driver_id = driver_id;
        booking.history.push(StatusChange {
            status,
            at: Utc::now(),
        });

        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Recipient {
    Driver(Uuid),
    Admins(Uuid),
}

#[derive(Clone, Debug)]
pub struct Delivery {
    pub recipient: Recipient,
    pub event: Event,
    pub payload: Value,
    pub at: DateTime<Utc>,
}

/// Gateway that logs and records every delivery instead of pushing it over a
/// socket. Individual drivers can be made to fail or to answer slowly.
#[derive(Debug, Default)]
pub struct RecordingGateway {
    deliveries: Mutex<Vec<Delivery>>,
    failing: HashSet<Uuid>,
    delays: HashMap<Uuid, Duration>,
}

impl RecordingGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_for(mut self, driver_id: Uuid) -> Self {
        self.failing.insert(driver_id);
        self
    }

    pub fn delayed_for(mut self, driver_id: Uuid, delay: Duration) -> Self {
        self.delays.insert(driver_id, delay);
        self
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn driver_events(&self, driver_id: Uuid) -> Vec<Event> {
        self.events_for(Recipient::Driver(driver_id))
    }

    pub fn admin_events(&self, tenant_id: Uuid) -> Vec<Event> {
        self.events_for(Recipient::Admins(tenant_id))
    }

    pub fn count(&self, event: Event) -> usize {
        self.deliveries()
            .iter()
            .filter(|delivery| delivery.event == event)
            .count()
    }

    fn events_for(&self, recipient: Recipient) -> Vec<Event> {
        self.deliveries()
            .into_iter()
            .filter(|delivery| delivery.recipient == recipient)
            .map(|delivery| delivery.event)
            .collect()
    }

    fn record(&self, recipient: Recipient, event: Event, payload: Value) {
        tracing::info!(?recipient, %event, "delivered notification");

        self.deliveries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Delivery {
                recipient,
                event,
                payload,
                at: Utc::now(),
            });
    }
}

#[async_trait]
impl NotificationGateway for RecordingGateway {
    async fn notify_driver(
        &self,
        driver_id: Uuid,
        event: Event,
        payload: Value,
    ) -> Result<(), Error> {
        if let Some(delay) = self.delays.get(&driver_id) {
            tokio::time::sleep(*delay).await;
        }

        if self.failing.contains(&driver_id) {
            return Err(upstream_error(format!("driver {} unreachable", driver_id)));
        }

        self.record(Recipient::Driver(driver_id), event, payload);
        Ok(())
    }

    async fn notify_tenant_admins(
        &self,
        tenant_id: Uuid,
        event: Event,
        payload: Value,
    ) -> Result<(), Error> {
        self.record(Recipient::Admins(tenant_id), event, payload);
        Ok(())
    }
}

#[tokio::test]
async fn set_busy_is_conditional_on_availability() {
    let pool = MemoryDriverPool::new();
    let driver = DriverCandidate::new(Uuid::new_v4(), "standard", None);
    let driver_id = driver.id;
    pool.upsert(driver).await;

    assert!(pool.set_busy(driver_id).await.is_ok());
    assert!(pool
        .set_busy(driver_id)
        .await
        .unwrap_err()
        .is_driver_unavailable_error());

    pool.set_available(driver_id).await.unwrap();
    assert!(pool.is_available(driver_id).await);
}

#[tokio::test]
async fn booking_writes_are_conditional_on_the_prior_status() {
    let bookings = MemoryBookingStore::new();
    let booking = Booking::new(Uuid::new_v4(), None);
    let booking_id = booking.id;
    bookings.insert(booking).await;

    bookings
        .set_status(booking_id, BookingStatus::Pending, BookingStatus::Dispatching, None)
        .await
        .unwrap();

    // a writer still holding the pending copy loses
    assert!(bookings
        .set_status(booking_id, BookingStatus::Pending, BookingStatus::Cancelled, None)
        .await
        .unwrap_err()
        .is_stale_write_error());

    let stored = bookings.get(booking_id).await.unwrap();
    assert_eq!(stored.status, BookingStatus::Dispatching);
    assert_eq!(stored.history.len(), 2);
}

#[tokio::test]
async fn list_available_scopes_by_tenant_and_type() {
    let pool = MemoryDriverPool::new();
    let tenant = Uuid::new_v4();

    pool.upsert(DriverCandidate::new(tenant, "standard", None)).await;
    pool.upsert(DriverCandidate::new(tenant, "van", None)).await;
    pool.upsert(DriverCandidate::new(Uuid::new_v4(), "standard", None))
        .await;

    assert_eq!(pool.list_available(tenant, None).await.unwrap().len(), 2);
    assert_eq!(
        pool.list_available(tenant, Some("van")).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn failing_driver_is_not_recorded() {
    let unreachable = Uuid::new_v4();
    let gateway = RecordingGateway::new().failing_for(unreachable);

    assert!(gateway
        .notify_driver(unreachable, Event::DispatchRequest, Value::Null)
        .await
        .is_err());
    assert!(gateway.deliveries().is_empty());
}
