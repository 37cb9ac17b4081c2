//! Kiln Core
//!
//! Domain types, ports, and error handling for the Kiln job execution
//! engine. This crate defines the vocabulary shared by the resolver, the
//! sandbox lifecycle, the step driver, and the cluster adapters.

pub mod config;
pub mod env;
pub mod error;
pub mod events;
pub mod ids;
pub mod interpolation;
pub mod job;
pub mod ports;
pub mod result;
pub mod sandbox;

pub use error::{Error, Result};
pub use ids::*;
