//! Provides types and functions shared by the mocker binary and related tooling.
#![deny(missing_docs)]
pub mod shutdown;
#[cfg(feature = "telemetry")]
pub mod telemetry;
