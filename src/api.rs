use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::Config;
use crate::entities::{
    Booking, BookingStatus, DispatchOutcome, DispatchStats, DispatchStatus, DriverResponse,
    ResponseOutcome, StartDispatch,
};
use crate::error::Error;

#[async_trait]
pub trait DispatchAPI {
    async fn start_dispatch(&self, params: StartDispatch) -> Result<DispatchOutcome, Error>;

    async fn handle_driver_response(
        &self,
        response: DriverResponse,
    ) -> Result<ResponseOutcome, Error>;

    async fn cancel_dispatch(&self, request_id: Uuid, tenant_id: Uuid) -> Result<(), Error>;

    /// Expires every request still searching past its deadline. Returns the
    /// ids of the requests expired by this call.
    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, Error>;

    async fn dispatch_status(
        &self,
        request_id: Uuid,
        tenant_id: Uuid,
    ) -> Result<DispatchStatus, Error>;

    /// Requests of the tenant still waiting for a driver.
    async fn pending_requests(&self, tenant_id: Uuid) -> Result<Vec<DispatchStatus>, Error>;

    async fn dispatch_stats(&self, tenant_id: Uuid) -> Result<DispatchStats, Error>;

    fn config(&self) -> &Config;
}

#[async_trait]
pub trait BookingAPI {
    /// Driver-reported progress along the trip.
    async fn advance_booking(
        &self,
        booking_id: Uuid,
        driver_id: Uuid,
        status: BookingStatus,
    ) -> Result<Booking, Error>;

    async fn cancel_booking(&self, booking_id: Uuid, tenant_id: Uuid) -> Result<Booking, Error>;
}

pub trait API: DispatchAPI + BookingAPI {}

pub type DynAPI = Arc<dyn API + Send + Sync>;
