//! Assembly of a [`CallEventProcessor`]
//!
//! Only the accounting system is mandatory. Transports, the contact source,
//! the history store and the chooser are optional collaborators.
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use callbridge_core::{AccountingSystem, BridgeConfig, CallEventProcessor};
//! # use callbridge_transport::{SocketConfig, SocketTransport};
//! # async fn example(accounting: Arc<dyn AccountingSystem>) -> callbridge_core::Result<()> {
//! let processor = CallEventProcessor::builder(BridgeConfig::default(), accounting)
//!     .transport(Arc::new(SocketTransport::new(SocketConfig::default())))
//!     .build()?;
//! processor.run().await
//! # }
//! ```

use std::sync::Arc;

use callbridge_transport::TransportProvider;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use super::stats::Counters;
use super::{CallEventProcessor, Inner};
use crate::accounting::{AccountingSystem, CallHistoryStore, ContactChooser, ContactSource};
use crate::config::BridgeConfig;
use crate::directory::ContactDirectory;
use crate::error::Result;
use crate::registry::CallRegistry;
use crate::resilience::ResilienceGateway;
use crate::routing::RoutingCache;

/// Assembles a [`CallEventProcessor`]
///
/// ```rust,ignore
/// let processor = CallEventProcessor::builder(config, accounting)
///     .transport(Arc::new(socket))
///     .contact_source(source)
///     .chooser(chooser)
///     .build()?;
/// ```
pub struct ProcessorBuilder {
    config: BridgeConfig,
    accounting: Arc<dyn AccountingSystem>,
    transports: Vec<Arc<dyn TransportProvider>>,
    contact_source: Option<Arc<dyn ContactSource>>,
    history: Option<Arc<dyn CallHistoryStore>>,
    chooser: Option<Arc<dyn ContactChooser>>,
}

impl ProcessorBuilder {
    pub(crate) fn new(config: BridgeConfig, accounting: Arc<dyn AccountingSystem>) -> Self {
        Self {
            config,
            accounting,
            transports: Vec::new(),
            contact_source: None,
            history: None,
            chooser: None,
        }
    }

    /// Register a transport; dial requests go to the first connected one in
    /// registration order
    pub fn transport(mut self, transport: Arc<dyn TransportProvider>) -> Self {
        self.transports.push(transport);
        self
    }

    pub fn contact_source(mut self, source: Arc<dyn ContactSource>) -> Self {
        self.contact_source = Some(source);
        self
    }

    pub fn history(mut self, history: Arc<dyn CallHistoryStore>) -> Self {
        self.history = Some(history);
        self
    }

    /// Without a chooser ambiguous calls keep their first candidate
    pub fn chooser(mut self, chooser: Arc<dyn ContactChooser>) -> Self {
        self.chooser = Some(chooser);
        self
    }

    pub fn build(self) -> Result<CallEventProcessor> {
        self.config.validate()?;

        let comparison_length = self.config.phone.comparison_length;
        let gateway = ResilienceGateway::new(
            self.accounting,
            self.config.resilience.failure_threshold,
            self.config.resilience.open_timeout(),
        )
        .with_call_timeout(self.config.resilience.call_timeout());

        Ok(CallEventProcessor {
            inner: Arc::new(Inner {
                directory: ContactDirectory::new(comparison_length),
                routing: RoutingCache::new(self.config.routing.window()),
                registry: CallRegistry::new(comparison_length),
                gateway,
                transports: self.transports,
                contact_source: self.contact_source,
                history: self.history,
                chooser: self.chooser,
                last_tags: DashMap::new(),
                disambiguations: DashMap::new(),
                counters: Counters::default(),
                shutdown: CancellationToken::new(),
                config: self.config,
            }),
        })
    }
}
