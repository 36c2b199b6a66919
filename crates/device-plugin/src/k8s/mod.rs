//! Kubernetes integration module.
//!
//! This module implements the kubelet device plugin protocol for the
//! virtual slots:
//! - [`device_plugin::PluginEndpoint`]: one gRPC endpoint instance, from
//!   socket bind and kubelet registration to shutdown
//! - [`device_plugin::DevicePluginService`]: the protocol handlers
//! - [`crash_policy::CrashTracker`]: when a crashing serve loop gives up

use core::error::Error;

pub mod crash_policy;
pub mod device_plugin;

pub use device_plugin::EndpointConfig;
pub use device_plugin::PluginEndpoint;

/// Errors that can occur while running the device plugin endpoint.
#[derive(Debug, derive_more::Display)]
pub enum DevicePluginError {
    #[display("device plugin transport failed: {message}")]
    Transport { message: String },
    #[display("failed to register with kubelet: {message}")]
    Registration { message: String },
    #[display("failed to watch {path}")]
    Watch { path: String },
    #[display("gRPC server for '{resource_name}' has repeatedly crashed recently")]
    CrashLoop { resource_name: String },
}

impl Error for DevicePluginError {}
