//! HQPlayer integration: dual-transport client, named-instance manager, and
//! the zone-link service feeding DSP enrichment.

pub mod client;
pub mod instances;
pub mod links;

pub use client::{
    discover_instances, DiscoveredInstance, HqpClient, HqpError, PipelineSnapshot,
};
pub use instances::{HqpInstanceManager, InstanceConfig, InstanceInfo};
pub use links::{HqpLinkService, ZoneLink};
