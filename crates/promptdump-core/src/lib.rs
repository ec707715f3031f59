//! promptdump core - flow identities, HTTP message records, and configuration
//!
//! This crate provides the types shared by every pipeline stage:
//!
//! - **Flows**: directional endpoint pairs at the network and transport layer
//! - **Segments**: decoded TCP segments handed from capture to reassembly
//! - **Messages**: parsed HTTP requests and responses with single-assignment bodies
//! - **Notifier**: the observer trait paired messages are delivered to
//! - **Config**: TOML configuration and its loader

pub mod config;
pub mod flow;
pub mod message;
pub mod notifier;
pub mod segment;

// Re-export commonly used types
pub use config::{
    CaptureSettings, CaptureSource, ConfigError, ConfigLoader, CorrelationSettings, PromptdumpConfig,
    ReassemblySettings,
};
pub use flow::{Flow, FlowId, NetworkFlow, TransportFlow};
pub use message::{Request, Response};
pub use notifier::Notifier;
pub use segment::{TcpFlags, TcpSegment};

/// promptdump version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
