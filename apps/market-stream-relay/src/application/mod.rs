//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the application services and port interfaces
//! that define how the domain interacts with external systems.

/// Port interfaces for external systems (upstream feed, summary cache).
pub mod ports;

/// Application services: registry, connectors, fan-out and projection.
pub mod services;
