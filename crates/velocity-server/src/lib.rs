//! HTTP trigger surface for the Velocity pipeline.
//!
//! An external scheduler POSTs one tick per worker; each tick claims and
//! processes at most one job. "No work" and handled business failures are
//! HTTP 200; 401/500 are reserved for auth and infrastructure errors.

pub mod config;
pub mod server;

pub use config::ServerConfig;
pub use server::{build_router, serve, AppState, ServerError};
