pub mod config;
pub mod error;
pub mod logging;
pub mod providers;
pub mod proxy;
pub mod router;
pub mod schema;
pub mod server;
pub mod translate;

pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use logging::ExchangeLog;
pub use router::{RouteTable, RoutingMode};
pub use server::{build_router, AppState};
pub use translate::Dialect;
