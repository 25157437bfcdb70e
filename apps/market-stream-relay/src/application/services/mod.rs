//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `SubscriptionRegistry`: Subscriptions and connector lifecycles
//! - `UpstreamConnector`: One reconnecting upstream stream per key
//! - `FanoutRouter`: Best-effort delivery to subscriber queues
//! - `SummaryProjector`: Summary records for summary subscribers and the cache
//! - `Relay`: Wires the above together

/// Upstream connector tasks and their observable status.
pub mod connector;

/// Summary projection and publication.
pub mod projector;

/// Reconnection delay schedule.
pub mod reconnect;

/// Subscription bookkeeping and connector ownership.
pub mod registry;

/// Relay composition root.
pub mod relay;

/// Fan-out delivery.
pub mod router;

pub use connector::{
    ConnectorHandle, ConnectorSettings, ConnectorSnapshot, ConnectorState, ConnectorStatus,
};
pub use projector::SummaryProjector;
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
pub use registry::{RegistryStats, SubscriptionRegistry, SubscriptionState};
pub use relay::{Relay, RelaySettings};
pub use router::FanoutRouter;
