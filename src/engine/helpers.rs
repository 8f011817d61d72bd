use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use uuid::Uuid;

use super::Engine;
use crate::{
    config::RESPONSE_TIMEOUT_SECS,
    entities::{Booking, BookingStatus, DispatchRequest, Event, NotifiedDriver, StartDispatch},
    error::{invalid_input_error, Error},
    external::NotificationGateway,
    geo,
};

/// Best-effort delivery to one driver, bounded by `timeout`.
pub async fn deliver(
    notifier: Arc<dyn NotificationGateway>,
    timeout: Duration,
    driver_id: Uuid,
    event: Event,
    payload: Value,
) {
    match tokio::time::timeout(timeout, notifier.notify_driver(driver_id, event, payload)).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::warn!(%driver_id, %event, %err, "driver notification failed"),
        Err(_) => tracing::warn!(%driver_id, %event, "driver notification timed out"),
    }
}

impl Engine {
    pub(super) async fn notify_driver(&self, driver_id: Uuid, event: Event, payload: Value) {
        deliver(
            self.notifier.clone(),
            self.config.notify_timeout(),
            driver_id,
            event,
            payload,
        )
        .await
    }

    pub(super) async fn notify_admins(&self, tenant_id: Uuid, event: Event, payload: Value) {
        let delivery = self
            .notifier
            .notify_tenant_admins(tenant_id, event, payload);

        match tokio::time::timeout(self.config.notify_timeout(), delivery).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!(%tenant_id, %event, %err, "admin notification failed"),
            Err(_) => tracing::warn!(%tenant_id, %event, "admin notification timed out"),
        }
    }

    /// Writes the booking's status and driver back, provided the stored
    /// record is still in `from`.
    pub(super) async fn save_booking(
        &self,
        booking: &Booking,
        from: BookingStatus,
    ) -> Result<(), Error> {
        self.bookings
            .set_status(booking.id, from, booking.status, booking.assigned_driver_id)
            .await
    }

    /// `Dispatching -> NoDriverFound`, validated against the current record.
    #[tracing::instrument(skip(self))]
    pub(super) async fn mark_no_driver(&self, booking_id: Uuid) -> Result<(), Error> {
        let mut booking = self.bookings.get(booking_id).await?;
        let from = booking.status;
        booking.mark_no_driver(self.clock.now())?;
        self.save_booking(&booking, from).await
    }

    pub(super) fn validate_start(&self, params: &StartDispatch) -> Result<(), Error> {
        params.pickup.validate()?;

        if let Some(radius_km) = params.radius_km {
            if radius_km.is_nan() || radius_km <= 0.0 {
                return Err(invalid_input_error("radius_km must be positive"));
            }

            if radius_km > self.config.max_search_radius_km {
                return Err(invalid_input_error(
                    "radius_km must not exceed max_search_radius_km",
                ));
            }
        }

        if let Some(vehicle_type) = &params.vehicle_type {
            if vehicle_type.trim().is_empty() {
                return Err(invalid_input_error("vehicle_type must not be empty"));
            }
        }

        if let Some(max_wait_secs) = params.max_wait_secs {
            if !RESPONSE_TIMEOUT_SECS.contains(&max_wait_secs) {
                return Err(invalid_input_error("max_wait_secs must be within [10, 120]"));
            }
        }

        Ok(())
    }
}

pub fn dispatch_request_payload(request: &DispatchRequest, driver: &NotifiedDriver) -> Value {
    json!({
        "request_id": request.id,
        "booking_id": request.booking_id,
        "pickup": request.pickup,
        "vehicle_type": request.vehicle_type,
        "distance_km": geo::round_km(driver.distance_km),
        "eta_minutes": driver.eta_minutes,
        "timeout_secs": (request.expires_at - request.created_at).num_seconds(),
        "expires_at": request.expires_at,
    })
}

pub fn request_summary(request: &DispatchRequest) -> Value {
    json!({
        "request_id": request.id,
        "booking_id": request.booking_id,
        "status": request.resolution.name(),
        "drivers_notified": request.notified().len(),
        "drivers_declined": request.declined.len(),
        "assigned_driver": request.winner(),
    })
}

pub fn booking_payload(booking: &Booking) -> Value {
    json!({
        "booking_id": booking.id,
        "status": booking.status.name(),
        "assigned_driver": booking.assigned_driver_id,
        "price": booking.price,
    })
}

#[test]
fn dispatch_payload_rounds_distance() {
    use crate::entities::Coordinates;

    let driver = NotifiedDriver {
        driver_id: Uuid::new_v4(),
        distance_km: 1.23456,
        eta_minutes: 3,
    };

    let request = DispatchRequest::new(
        Uuid::new_v4(),
        Uuid::new_v4(),
        Coordinates::new(48.85, 2.35),
        Some("standard".into()),
        vec![driver.clone()],
        chrono::Utc::now(),
        chrono::Duration::seconds(45),
    );

    let payload = dispatch_request_payload(&request, &driver);

    assert_eq!(payload["distance_km"], json!(1.23));
    assert_eq!(payload["eta_minutes"], json!(3));
    assert_eq!(payload["timeout_secs"], json!(45));
    assert_eq!(payload["request_id"], json!(request.id));
}
