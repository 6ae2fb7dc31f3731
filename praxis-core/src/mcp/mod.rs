//! Multi-server MCP aggregation: configuration, transport sessions,
//! connection registry, namespaced catalog, and the aggregator façade.

pub mod aggregator;
pub mod catalog;
pub mod config;
pub mod metrics;
pub mod ping;
pub mod registry;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use aggregator::{CallContext, McpAggregator};
pub use catalog::{Catalog, CatalogEntry, NAMESPACE_SEP, Route};
pub use config::{AggregatorConfig, ServerConfig, TransportConfig};
pub use metrics::{ChannelMetrics, ChannelSnapshot};
pub use ping::{DEFAULT_PING_THRESHOLD, PingFailureTracker};
pub use registry::{ServerConnection, ServerStatus};
pub use transport::{
    Completion, CompletionTarget, Connector, Discovery, PromptDescriptor, PromptOutput,
    ResourceDescriptor, ResourceOutput, RmcpConnector, ServerHandle, ToolDescriptor, ToolOutput,
};
