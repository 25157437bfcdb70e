//! Domain Layer - Core relay types and business logic.
//!
//! This layer contains the core domain types for the market stream relay
//! with no runtime dependencies. Everything here is plain data plus
//! serialization support, and can be exercised without a Tokio runtime.

/// Stream identity: stream types, symbols, and stream keys.
pub mod stream;

/// Subscription bookkeeping shared by raw streams and summaries.
pub mod subscription;

/// Feed message classification and summary projection.
pub mod summary;
