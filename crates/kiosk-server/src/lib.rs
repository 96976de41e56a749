//! # kiosk-server
//!
//! HTTP front end for Kiosk sandboxes.
//!
//! The binary wires the Docker and tunnel backends from `kiosk-backend`
//! into a `kiosk-core` orchestrator and exposes it over a small JSON API
//! (see [`http`]). Visitors are told apart by an opaque cookie.

pub mod config;
pub mod http;
pub mod types;

pub use config::{KioskConfig, TunnelMode};
pub use http::{build_router, serve};
