//! Layout REST Service
//!
//! JSON over HTTP rendition of the layout RPC surface.
//!
//! ## Endpoints
//!
//! - `POST /api/layout` - CalculateLayout on the graph carried by the request
//! - `GET /api/layout/runs/:run_id` - Latest progress record of a run
//! - `GET /api/health?service=` - HealthCheck (`SERVING` / `NOT_SERVING`)
//! - `GET /health` - Detailed service health check
//! - `GET /health/live` - Liveness probe
//! - `GET /health/ready` - Readiness probe

pub mod middleware;
pub mod routes;
pub mod state;

pub use middleware::{metrics_middleware, request_logging_middleware};
#[cfg(feature = "postgres")]
pub use routes::AppState;
pub use routes::{create_router, CalculateLayoutRequest, CalculateLayoutResponse, ServingStatus};
pub use state::ServiceState;
