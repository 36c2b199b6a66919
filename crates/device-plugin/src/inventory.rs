//! Physical accelerator discovery.
//!
//! The plugin's own pod is handed the physical accelerators it manages by
//! the vendor device plugin, through the usual visibility variables. Those
//! same accelerators are then re-advertised as virtual slots.

use std::collections::HashSet;
use std::num::NonZeroU32;
use std::path::Path;

use core::error::Error;
use error_stack::Report;
use error_stack::ResultExt;
use serde::Serialize;
use tracing::info;

pub const ASCEND_RT_VISIBLE_DEVICES: &str = "ASCEND_RT_VISIBLE_DEVICES";
pub const ASCEND_VISIBLE_DEVICES: &str = "ASCEND_VISIBLE_DEVICES";
pub const NPU_VISIBLE_DEVICES: &str = "NPU_VISIBLE_DEVICES";
pub const NVIDIA_VISIBLE_DEVICES: &str = "NVIDIA_VISIBLE_DEVICES";
pub const VIRTUAL_DEVICES_ENV: &str = "NVSHARE_VIRTUAL_DEVICES";

/// Value of `NVIDIA_VISIBLE_DEVICES` when the NVIDIA device plugin exposes
/// devices as volume mounts; the device UUIDs are then the file names in
/// this directory.
pub const NVIDIA_EXPOSE_MOUNT_DIR: &str = "/var/run/nvidia-container-devices";

/// Ascend variables in order of precedence
const ASCEND_CANDIDATES: [&str; 3] = [
    ASCEND_RT_VISIBLE_DEVICES,
    ASCEND_VISIBLE_DEVICES,
    NPU_VISIBLE_DEVICES,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, derive_more::Display)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[display("cuda")]
    Cuda,
    #[display("ascend")]
    Ascend,
}

/// How the accelerators are made visible to a workload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Exposure {
    /// the visibility variable carries the accelerator ids
    EnvVar,
    /// the visibility variable points at [`NVIDIA_EXPOSE_MOUNT_DIR`] and one
    /// placeholder file per accelerator is mounted there
    VolumeMounts,
}

/// Errors that stop the plugin at startup.
#[derive(Debug, derive_more::Display)]
pub enum InventoryError {
    #[display("none of ASCEND_RT_VISIBLE_DEVICES/ASCEND_VISIBLE_DEVICES/NPU_VISIBLE_DEVICES/NVIDIA_VISIBLE_DEVICES is set")]
    NoVisibleDevices,
    #[display("NVSHARE_VIRTUAL_DEVICES is not set")]
    VirtualDevicesUnset,
    #[display("virtual devices per accelerator must be a positive integer, got {value:?}")]
    VirtualDevicesInvalid { value: String },
    #[display("failed to read accelerator ids from {path}")]
    MountDirUnreadable { path: String },
    #[display("no accelerator ids found in {source_name}")]
    EmptyInventory { source_name: String },
}

impl Error for InventoryError {}

/// Accelerators managed by this plugin and how to expose them
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Inventory {
    pub accelerator_ids: Vec<String>,
    pub slots_per_accelerator: NonZeroU32,
    pub backend: Backend,
    /// variable that carries accelerator visibility into workloads
    pub visibility_env: String,
    pub exposure: Exposure,
}

impl Inventory {
    /// detect the inventory from the process environment
    pub fn from_env(virtual_devices: Option<&str>) -> Result<Self, Report<InventoryError>> {
        Self::detect(
            |key| std::env::var(key).ok(),
            virtual_devices,
            Path::new(NVIDIA_EXPOSE_MOUNT_DIR),
        )
    }

    pub fn detect(
        lookup: impl Fn(&str) -> Option<String>,
        virtual_devices: Option<&str>,
        mount_dir: &Path,
    ) -> Result<Self, Report<InventoryError>> {
        let (visibility_env, value) =
            detect_visible_devices(&lookup).ok_or(InventoryError::NoVisibleDevices)?;

        let slots_per_accelerator = parse_virtual_devices(virtual_devices)?;

        let is_nvidia = visibility_env == NVIDIA_VISIBLE_DEVICES;
        let backend = if is_nvidia {
            Backend::Cuda
        } else {
            Backend::Ascend
        };

        let (accelerator_ids, exposure) = if is_nvidia && value.trim() == NVIDIA_EXPOSE_MOUNT_DIR {
            info!("NVIDIA devices are exposed through volume mounts, following the same strategy");
            (read_mount_dir(mount_dir)?, Exposure::VolumeMounts)
        } else {
            (split_visible_devices(&value), Exposure::EnvVar)
        };

        if accelerator_ids.is_empty() {
            return Err(Report::new(InventoryError::EmptyInventory {
                source_name: visibility_env.to_string(),
            }));
        }

        info!(
            "runtime backend={backend}, accelerators={accelerator_ids:?}, slots per accelerator={slots_per_accelerator}"
        );

        Ok(Self {
            accelerator_ids,
            slots_per_accelerator,
            backend,
            visibility_env: visibility_env.to_string(),
            exposure,
        })
    }
}

/// first non-blank visibility variable, Ascend variables taking precedence
fn detect_visible_devices(
    lookup: &impl Fn(&str) -> Option<String>,
) -> Option<(&'static str, String)> {
    ASCEND_CANDIDATES
        .iter()
        .chain(std::iter::once(&NVIDIA_VISIBLE_DEVICES))
        .find_map(|&key| {
            lookup(key)
                .filter(|value| !value.trim().is_empty())
                .map(|value| (key, value))
        })
}

fn parse_virtual_devices(value: Option<&str>) -> Result<NonZeroU32, Report<InventoryError>> {
    let value = value.ok_or(InventoryError::VirtualDevicesUnset)?;
    value
        .trim()
        .parse::<NonZeroU32>()
        .change_context_lazy(|| InventoryError::VirtualDevicesInvalid {
            value: value.to_string(),
        })
}

/// Comma separated ids, blanks dropped; a repeated id is kept only where it
/// first appears so that every advertised slot id stays unique.
pub fn split_visible_devices(value: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    value
        .split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty() && seen.insert(*token))
        .map(str::to_string)
        .collect()
}

fn read_mount_dir(mount_dir: &Path) -> Result<Vec<String>, Report<InventoryError>> {
    let unreadable = || InventoryError::MountDirUnreadable {
        path: mount_dir.display().to_string(),
    };

    let mut ids = Vec::new();
    for entry in std::fs::read_dir(mount_dir).change_context_lazy(unreadable)? {
        let entry = entry.change_context_lazy(unreadable)?;
        ids.push(entry.file_name().to_string_lossy().into_owned());
    }
    ids.sort();
    Ok(ids)
}
