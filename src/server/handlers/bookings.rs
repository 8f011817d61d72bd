use axum::extract::{Extension, Json, Path};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::{BookingAPI, DynAPI};
use crate::entities::{Booking, BookingStatus};
use crate::error::Error;
use crate::server::Tenant;

#[derive(Serialize, Deserialize)]
pub struct AdvanceParams {
    driver_id: Uuid,
    status: BookingStatus,
}

pub async fn advance(
    Extension(api): Extension<DynAPI>,
    Path(id): Path<Uuid>,
    Json(params): Json<AdvanceParams>,
) -> Result<Json<Booking>, Error> {
    let booking = api
        .advance_booking(id, params.driver_id, params.status)
        .await?;

    Ok(booking.into())
}

pub async fn cancel(
    Extension(api): Extension<DynAPI>,
    Tenant(tenant_id): Tenant,
    Path(id): Path<Uuid>,
) -> Result<Json<Booking>, Error> {
    let booking = api.cancel_booking(id, tenant_id).await?;

    Ok(booking.into())
}
