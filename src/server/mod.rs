mod handlers;

use std::future::Future;
use std::net::SocketAddr;

use async_trait::async_trait;
use axum::{
    extract::{Extension, FromRequest, RequestParts},
    routing::{delete, get, patch, post, put},
    Router,
};
use uuid::Uuid;

use crate::api::DynAPI;
use crate::error::{invalid_input_error, upstream_error, Error};
use crate::server::handlers::{bookings, dispatch};

pub const TENANT_HEADER: &str = "x-tenant-id";

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:3000";

/// Tenant on whose behalf the request is made, taken from the `x-tenant-id`
/// header. Authenticating it is left to the gateway in front of this service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tenant(pub Uuid);

#[async_trait]
impl<B: Send> FromRequest<B> for Tenant {
    type Rejection = Error;

    async fn from_request(req: &mut RequestParts<B>) -> Result<Self, Self::Rejection> {
        let value = req
            .headers()
            .get(TENANT_HEADER)
            .ok_or_else(|| invalid_input_error("missing x-tenant-id header"))?;

        let id = value
            .to_str()
            .ok()
            .and_then(|raw| Uuid::parse_str(raw.trim()).ok())
            .ok_or_else(|| invalid_input_error("x-tenant-id must be a uuid"))?;

        Ok(Tenant(id))
    }
}

pub fn router(api: DynAPI) -> Router {
    Router::new()
        .route("/dispatch/request", post(dispatch::start))
        .route("/dispatch/respond", post(dispatch::respond))
        .route("/dispatch/status/:id", get(dispatch::status))
        .route("/dispatch/cancel/:id", delete(dispatch::cancel))
        .route("/dispatch/pending", get(dispatch::pending))
        .route("/dispatch/stats", get(dispatch::stats))
        .route("/dispatch/config", get(dispatch::config))
        .route("/bookings/:id/status", put(bookings::advance))
        .route("/bookings/:id/cancel", patch(bookings::cancel))
        .layer(Extension(api))
}

/// Reads `DISPATCH_BIND_ADDR`, defaulting to the loopback interface.
pub fn bind_addr() -> Result<SocketAddr, Error> {
    let raw = std::env::var("DISPATCH_BIND_ADDR").unwrap_or_else(|_| DEFAULT_BIND_ADDR.into());

    raw.parse()
        .map_err(|_| invalid_input_error("DISPATCH_BIND_ADDR must be host:port"))
}

pub async fn serve<F>(api: DynAPI, addr: SocketAddr, shutdown: F) -> Result<(), Error>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(api);

    tracing::info!("listening on {}", addr);

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(upstream_error)
}

#[test]
fn tenant_header_is_required_and_parsed() {
    use axum::http::Request;

    let tenant_id = Uuid::new_v4();

    let request = Request::builder()
        .header(TENANT_HEADER, tenant_id.to_string())
        .body(())
        .unwrap();
    let mut parts = RequestParts::new(request);
    assert_eq!(
        tokio_test::block_on(Tenant::from_request(&mut parts)).unwrap(),
        Tenant(tenant_id)
    );

    let request = Request::builder().body(()).unwrap();
    let mut parts = RequestParts::new(request);
    assert!(tokio_test::block_on(Tenant::from_request(&mut parts))
        .unwrap_err()
        .is_invalid_input_error());

    let request = Request::builder()
        .header(TENANT_HEADER, "acme")
        .body(())
        .unwrap();
    let mut parts = RequestParts::new(request);
    assert!(tokio_test::block_on(Tenant::from_request(&mut parts)).is_err());
}
