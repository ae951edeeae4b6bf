//! Shared types and pure logic for CaptureLapse.

pub mod config;
pub mod protocol;
pub mod schedule;
pub mod snapshot;
pub mod sun;
