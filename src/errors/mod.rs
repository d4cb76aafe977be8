//! Error type definitions for the gateway.
//!
//! Mirrors the layered error design of the original service: a top-level
//! `GatewayError` that wraps per-subsystem error enums via `#[from]`, plus
//! convenience constructors for the call sites that build an error from
//! scratch rather than propagating one.

mod types;

pub use types::*;
