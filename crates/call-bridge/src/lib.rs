//! Call-event bridging and contact-resolution engine
//!
//! `callbridge-core` sits between the telephone switch and an accounting
//! system. Call events from any [`callbridge_transport::TransportProvider`]
//! become one coherent call lifecycle; callers are resolved against the
//! accounting system's contact directory; notifications are relayed through a
//! circuit breaker so an absent accounting system never stalls call handling.
//!
//! ## Components
//!
//! | Module | Role |
//! |--------|------|
//! | [`phone`] | number normalization |
//! | [`directory`] | contact index with exact and suffix lookup |
//! | [`routing`] | recently chosen contact per number |
//! | [`state`] | call state transition table |
//! | [`registry`] | live calls and pending dial requests |
//! | [`resilience`] | circuit breaker around the accounting system |
//! | [`processor`] | the orchestrator |
//!
//! ## Example
//!
//! ```rust,ignore
//! use callbridge_core::prelude::*;
//!
//! let processor = CallEventProcessor::builder(BridgeConfig::default(), accounting)
//!     .transport(Arc::new(SocketTransport::new(SocketConfig::default())))
//!     .contact_source(contacts)
//!     .build()?;
//!
//! tokio::spawn({
//!     let processor = processor.clone();
//!     async move { processor.run().await }
//! });
//!
//! processor.dial("+49 89 112233", "S1", None).await?;
//! ```

pub mod accounting;
pub mod config;
pub mod directory;
pub mod error;
pub mod phone;
pub mod processor;
pub mod registry;
pub mod resilience;
pub mod routing;
pub mod state;

pub use accounting::{AccountingCommand, AccountingSystem, CallData, CallHistoryStore, ContactChooser, ContactSource};
pub use config::BridgeConfig;
pub use directory::{Contact, ContactCommunication, ContactDirectory, ContactIndex, ContactMatch, MIN_SUFFIX_MATCH_LENGTH};
pub use error::{AccountingError, BridgeError, Result};
pub use processor::{CallEventProcessor, CommandOutcome, DropOutcome, EventOutcome, ProcessorBuilder, ProcessorStats};
pub use registry::{CallId, CallRecord, CallRegistry, PendingOutboundCall, SweepReport};
pub use resilience::{CircuitBreaker, CircuitBreakerState, CircuitStatus, ResilienceGateway};
pub use routing::{RoutingCache, RoutingCandidate};
pub use state::{CallState, CallStateMachine, TransitionOutcome};

pub mod prelude {
    pub use crate::accounting::{
        AccountingCommand, AccountingSystem, CallData, CallHistoryStore, ContactChooser, ContactSource,
    };
    pub use crate::config::BridgeConfig;
    pub use crate::directory::{Contact, ContactMatch};
    pub use crate::error::{AccountingError, BridgeError};
    pub use crate::processor::{CallEventProcessor, CommandOutcome, DropOutcome, EventOutcome};
    pub use crate::registry::CallId;
    pub use crate::state::CallState;
    pub use callbridge_transport::prelude::*;
}
