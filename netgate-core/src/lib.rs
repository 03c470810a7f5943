//! netgate-core: Shared library for the netgate captive-portal access controller
//!
//! This crate provides:
//! - MAC address parsing and canonical formatting
//! - Firewall rule controllers and the network access synchronizer
//! - The persisted registry of users, devices and connection logs
//! - The device lifecycle service that ties the two together

pub mod config;
pub mod mac;
pub mod network;
pub mod registry;
pub mod service;
pub mod store;

pub use config::Config;
pub use mac::MacAddress;
pub use network::{
    IptablesController, MemoryController, NetworkAccessSynchronizer, NetworkAction, NetworkError,
    NetworkRuleController,
};
pub use registry::{Device, Reachability, Registry, Role, User};
pub use service::{AccessService, ServiceError};
pub use store::StateFile;

/// Default ceiling on devices registered per user
pub const DEFAULT_MAX_DEVICES_PER_USER: u32 = 4;

/// Directory name used under the platform config and data dirs
pub const APP_DIR_NAME: &str = "netgate";
