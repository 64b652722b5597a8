//! HTTP surface: a thin, stateless layer over Store and Hub.

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::{AllowAll, AppState, PlanGate};
