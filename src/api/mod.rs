//! HTTP surface: JSend responses, bearer-token middleware, and the route
//! table.

pub mod handlers;
pub mod middleware;
pub mod response;
pub mod routes;

pub use routes::create_router;
