//! Shared API type definitions
//!
//! This crate contains the kubelet device plugin protocol (`v1beta1`) used
//! between the device plugin and the kubelet: generated gRPC messages,
//! clients and servers, plus the well-known constants of the protocol.

#![allow(clippy::doc_markdown)]

pub mod v1beta1 {
    #![allow(clippy::doc_overindented_list_items)]
    tonic::include_proto!("v1beta1");
}

/// API version sent in every registration request
pub const VERSION: &str = "v1beta1";

/// Health value of a device that can be allocated
pub const HEALTHY: &str = "Healthy";

/// Directory holding the kubelet socket and every device plugin socket
pub const DEVICE_PLUGIN_PATH: &str = "/var/lib/kubelet/device-plugins/";

/// File name of the kubelet registration socket inside [`DEVICE_PLUGIN_PATH`]
pub const KUBELET_SOCKET_NAME: &str = "kubelet.sock";

/// Full path of the kubelet registration socket
pub const KUBELET_SOCKET: &str = "/var/lib/kubelet/device-plugins/kubelet.sock";
