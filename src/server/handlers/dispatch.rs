use axum::extract::{Extension, Json, Path};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::api::{DispatchAPI, DynAPI};
use crate::config::Config;
use crate::entities::{
    Coordinates, DispatchOutcome, DispatchStats, DispatchStatus, DriverResponse, ResponseOutcome,
    StartDispatch,
};
use crate::error::Error;
use crate::server::Tenant;

#[derive(Serialize, Deserialize)]
pub struct StartParams {
    booking_id: Uuid,
    pickup: Coordinates,
    #[serde(default)]
    vehicle_type: Option<String>,
    #[serde(default)]
    exclude_ids: Vec<Uuid>,
    #[serde(default)]
    preferred_ids: Vec<Uuid>,
    #[serde(default)]
    radius_km: Option<f64>,
    #[serde(default)]
    max_wait_secs: Option<i64>,
}

pub async fn start(
    Extension(api): Extension<DynAPI>,
    Tenant(tenant_id): Tenant,
    Json(params): Json<StartParams>,
) -> Result<Json<DispatchOutcome>, Error> {
    let outcome = api
        .start_dispatch(StartDispatch {
            booking_id: params.booking_id,
            tenant_id,
            pickup: params.pickup,
            vehicle_type: params.vehicle_type,
            exclude_ids: params.exclude_ids,
            preferred_ids: params.preferred_ids,
            radius_km: params.radius_km,
            max_wait_secs: params.max_wait_secs,
        })
        .await?;

    Ok(outcome.into())
}

pub async fn respond(
    Extension(api): Extension<DynAPI>,
    Json(response): Json<DriverResponse>,
) -> Result<Json<ResponseOutcome>, Error> {
    let outcome = api.handle_driver_response(response).await?;

    Ok(outcome.into())
}

pub async fn status(
    Extension(api): Extension<DynAPI>,
    Tenant(tenant_id): Tenant,
    Path(id): Path<Uuid>,
) -> Result<Json<DispatchStatus>, Error> {
    let status = api.dispatch_status(id, tenant_id).await?;

    Ok(status.into())
}

pub async fn cancel(
    Extension(api): Extension<DynAPI>,
    Tenant(tenant_id): Tenant,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, Error> {
    api.cancel_dispatch(id, tenant_id).await?;

    Ok(Json(json!({ "request_id": id, "cancelled": true })))
}

pub async fn pending(
    Extension(api): Extension<DynAPI>,
    Tenant(tenant_id): Tenant,
) -> Result<Json<Vec<DispatchStatus>>, Error> {
    let pending = api.pending_requests(tenant_id).await?;

    Ok(pending.into())
}

pub async fn stats(
    Extension(api): Extension<DynAPI>,
    Tenant(tenant_id): Tenant,
) -> Result<Json<DispatchStats>, Error> {
    let stats = api.dispatch_stats(tenant_id).await?;

    Ok(stats.into())
}

pub async fn config(Extension(api): Extension<DynAPI>) -> Json<Config> {
    api.config().clone().into()
}
