//! # comfoconnect-client
//!
//! Async client for ComfoConnect gateways.
//!
//! This crate provides:
//! - UDP discovery of gateways on the local network
//! - A TCP transport with keep-alive and message-id correlation
//! - Session management with automatic registration and resubscription
//! - Property subscriptions and RMI property reads and writes

pub mod client;
pub mod completion;
pub mod config;
pub mod discovery;
pub mod error;
pub mod property;
pub mod transport;

pub use client::{Client, ClientEvent, NodeInfo, Response, SessionState};
pub use completion::{Completion, Waiter};
pub use config::{ClientConfig, DiscoveryConfig};
pub use discovery::{DiscoveredDevice, Discovery, DiscoveryEvent};
pub use error::{ClientError, ConfigError};
pub use property::{PropertyDescriptor, PropertyUpdate, RmiProperty};
pub use transport::{Transport, TransportEvent, TransportState};

pub use tokio_util::sync::CancellationToken;
