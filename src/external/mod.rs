//! Collaborators owned by the surrounding system. The engine only sees these
//! traits; `memory` holds the in-process versions used by the demo server,
//! the load simulation and tests.

pub mod memory;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::entities::{Booking, BookingStatus, DriverCandidate, Event};
use crate::error::Error;

#[async_trait]
pub trait DriverPool: Send + Sync {
    /// Read-only snapshot of the tenant's available drivers.
    async fn list_available(
        &self,
        tenant_id: Uuid,
        vehicle_type: Option<&str>,
    ) -> Result<Vec<DriverCandidate>, Error>;
}

#[async_trait]
pub trait BookingStore: Send + Sync {
    async fn get(&self, booking_id: Uuid) -> Result<Booking, Error>;

    /// Compare-and-set: writes the status and the assigned driver only while
    /// the stored status is still `expected`, otherwise fails with a
    /// stale-write error. Only the engine holds a handle that calls this.
    async fn set_status(
        &self,
        booking_id: Uuid,
        expected: BookingStatus,
        status: BookingStatus,
        driver_id: Option<Uuid>,
    ) -> Result<(), Error>;
}

#[async_trait]
pub trait DriverStatusStore: Send + Sync {
    /// Conditional: fails with a driver-unavailable error when the driver is
    /// not available any more.
    async fn set_busy(&self, driver_id: Uuid) -> Result<(), Error>;

    async fn set_available(&self, driver_id: Uuid) -> Result<(), Error>;
}

#[async_trait]
pub trait NotificationGateway: Send + Sync {
    async fn notify_driver(&self, driver_id: Uuid, event: Event, payload: Value)
        -> Result<(), Error>;

    async fn notify_tenant_admins(
        &self,
        tenant_id: Uuid,
        event: Event,
        payload: Value,
    ) -> Result<(), Error>;
}
