//! HTTP surface — job submission, progress streaming, artifact download.

pub mod routes;

pub use routes::{AppState, relay_routes};
