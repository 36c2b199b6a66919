//! Translation of allocated slots into container environment and mounts.

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;

use api_types::v1beta1;
use tracing::info;

use crate::inventory::Exposure;
use crate::inventory::Inventory;
use crate::inventory::NVIDIA_EXPOSE_MOUNT_DIR;
use crate::slot::parse_slot_id;
use crate::slot::MalformedSlotId;
use crate::slot::Slot;

pub const LD_PRELOAD: &str = "LD_PRELOAD";

/// host file bind-mounted as the per-accelerator placeholder in mount mode
pub const EXPOSE_MOUNT_HOST_PATH: &str = "/dev/null";

/// Why a single container request could not be allocated.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum AllocationError {
    #[display("unknown device: {id}")]
    UnknownDevice { id: String },
    #[display("{_0}")]
    MalformedSlotId(MalformedSlotId),
}

impl core::error::Error for AllocationError {}

/// Host and container locations of the files every workload gets mounted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadPaths {
    pub lib_host_path: String,
    pub lib_container_path: String,
    pub scheduler_socket_host_path: String,
    pub scheduler_socket_container_path: String,
}

impl Default for WorkloadPaths {
    fn default() -> Self {
        Self {
            lib_host_path: "/var/run/nvshare/libnvshare.so".to_string(),
            lib_container_path: "/usr/lib/libnvshare.so".to_string(),
            scheduler_socket_host_path: "/var/run/nvshare/scheduler.sock".to_string(),
            scheduler_socket_container_path: "/var/run/nvshare/scheduler.sock".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub host_path: String,
    pub container_path: String,
    pub read_only: bool,
}

/// What a container needs to use the slots it was allocated
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContainerAllocation {
    /// distinct physical accelerators behind the slots, first seen first
    pub accelerator_ids: Vec<String>,
    pub envs: HashMap<String, String>,
    pub mounts: Vec<MountSpec>,
}

impl From<MountSpec> for v1beta1::Mount {
    fn from(mount: MountSpec) -> Self {
        Self {
            container_path: mount.container_path,
            host_path: mount.host_path,
            read_only: mount.read_only,
        }
    }
}

impl From<ContainerAllocation> for v1beta1::ContainerAllocateResponse {
    fn from(allocation: ContainerAllocation) -> Self {
        Self {
            envs: allocation.envs,
            mounts: allocation.mounts.into_iter().map(Into::into).collect(),
            devices: Vec::new(),
            annotations: HashMap::new(),
            cdi_devices: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AllocationHandler {
    advertised: HashSet<String>,
    visibility_env: String,
    exposure: Exposure,
    paths: WorkloadPaths,
}

impl AllocationHandler {
    pub fn new(slots: &[Slot], inventory: &Inventory, paths: WorkloadPaths) -> Self {
        Self {
            advertised: slots.iter().map(Slot::id).collect(),
            visibility_env: inventory.visibility_env.clone(),
            exposure: inventory.exposure,
            paths,
        }
    }

    /// Allocate every container request independently.
    ///
    /// A failing request never affects the processing of the others.
    pub fn allocate<I, R>(&self, requests: I) -> Vec<Result<ContainerAllocation, AllocationError>>
    where
        I: IntoIterator<Item = R>,
        R: AsRef<[String]>,
    {
        requests
            .into_iter()
            .map(|slot_ids| self.allocate_container(slot_ids.as_ref()))
            .collect()
    }

    pub fn allocate_container(
        &self,
        slot_ids: &[String],
    ) -> Result<ContainerAllocation, AllocationError> {
        for slot_id in slot_ids {
            info!("received allocate request for {slot_id}");
            if !self.advertised.contains(slot_id) {
                return Err(AllocationError::UnknownDevice {
                    id: slot_id.clone(),
                });
            }
        }

        let mut accelerator_ids: Vec<String> = Vec::new();
        for slot_id in slot_ids {
            let (accelerator_id, _) =
                parse_slot_id(slot_id).map_err(AllocationError::MalformedSlotId)?;
            if !accelerator_ids.iter().any(|id| id == accelerator_id) {
                accelerator_ids.push(accelerator_id.to_string());
            }
        }

        let visible = match self.exposure {
            Exposure::EnvVar => accelerator_ids.join(","),
            Exposure::VolumeMounts => NVIDIA_EXPOSE_MOUNT_DIR.to_string(),
        };
        let envs = HashMap::from([
            (LD_PRELOAD.to_string(), self.paths.lib_container_path.clone()),
            (self.visibility_env.clone(), visible),
        ]);

        let mut mounts = vec![
            MountSpec {
                host_path: self.paths.lib_host_path.clone(),
                container_path: self.paths.lib_container_path.clone(),
                read_only: true,
            },
            MountSpec {
                host_path: self.paths.scheduler_socket_host_path.clone(),
                container_path: self.paths.scheduler_socket_container_path.clone(),
                read_only: true,
            },
        ];
        if self.exposure == Exposure::VolumeMounts {
            mounts.extend(accelerator_ids.iter().map(|accelerator_id| MountSpec {
                host_path: EXPOSE_MOUNT_HOST_PATH.to_string(),
                container_path: Path::new(NVIDIA_EXPOSE_MOUNT_DIR)
                    .join(accelerator_id)
                    .to_string_lossy()
                    .into_owned(),
                read_only: false,
            }));
        }

        Ok(ContainerAllocation {
            accelerator_ids,
            envs,
            mounts,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU32;

    use similar_asserts::assert_eq;

    use super::*;
    use crate::inventory::Backend;
    use crate::inventory::NVIDIA_VISIBLE_DEVICES;
    use crate::slot::enumerate_slots;

    fn inventory(exposure: Exposure) -> Inventory {
        Inventory {
            accelerator_ids: vec!["GPU-A".to_string(), "GPU-B".to_string()],
            slots_per_accelerator: NonZeroU32::new(2).expect("non-zero"),
            backend: Backend::Cuda,
            visibility_env: NVIDIA_VISIBLE_DEVICES.to_string(),
            exposure,
        }
    }

    fn handler(exposure: Exposure) -> AllocationHandler {
        let inventory = inventory(exposure);
        let slots = enumerate_slots(&inventory.accelerator_ids, inventory.slots_per_accelerator);
        AllocationHandler::new(&slots, &inventory, WorkloadPaths::default())
    }

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn single_accelerator_env_and_mounts() {
        let allocation = handler(Exposure::EnvVar)
            .allocate_container(&ids(&["GPU-A__1", "GPU-A__2"]))
            .expect("should allocate");

        assert_eq!(allocation.accelerator_ids, vec!["GPU-A"]);
        assert_eq!(
            allocation.envs.get(NVIDIA_VISIBLE_DEVICES).map(String::as_str),
            Some("GPU-A")
        );
        assert_eq!(
            allocation.envs.get(LD_PRELOAD).map(String::as_str),
            Some("/usr/lib/libnvshare.so")
        );
        assert_eq!(allocation.mounts.len(), 2);
        assert!(allocation.mounts.iter().all(|m| m.read_only));
    }

    #[test]
    fn two_accelerators_are_listed_once_each() {
        let allocation = handler(Exposure::EnvVar)
            .allocate_container(&ids(&["GPU-B__1", "GPU-A__2", "GPU-B__2"]))
            .expect("should allocate");

        let visible = allocation
            .envs
            .get(NVIDIA_VISIBLE_DEVICES)
            .expect("visibility env should be set");
        let mut listed: Vec<&str> = visible.split(',').collect();
        listed.sort_unstable();
        assert_eq!(listed, vec!["GPU-A", "GPU-B"]);
    }

    #[test]
    fn unknown_id_fails_only_its_own_request() {
        let results = handler(Exposure::EnvVar).allocate([
            ids(&["GPU-A__1"]),
            ids(&["GPU-B__1", "GPU-C__1"]),
            ids(&["GPU-B__2"]),
        ]);

        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert_eq!(
            results[1],
            Err(AllocationError::UnknownDevice {
                id: "GPU-C__1".to_string()
            })
        );
        assert_eq!(
            results[2].as_ref().map(|a| a.accelerator_ids.clone()),
            Ok(vec!["GPU-B".to_string()])
        );
    }

    #[test]
    fn volume_mounts_add_one_placeholder_per_accelerator() {
        let allocation = handler(Exposure::VolumeMounts)
            .allocate_container(&ids(&["GPU-A__1", "GPU-B__1", "GPU-B__2"]))
            .expect("should allocate");

        assert_eq!(
            allocation.envs.get(NVIDIA_VISIBLE_DEVICES).map(String::as_str),
            Some(NVIDIA_EXPOSE_MOUNT_DIR)
        );
        let placeholders: Vec<(&str, &str)> = allocation
            .mounts
            .iter()
            .filter(|m| m.host_path == EXPOSE_MOUNT_HOST_PATH)
            .map(|m| (m.host_path.as_str(), m.container_path.as_str()))
            .collect();
        assert_eq!(
            placeholders,
            vec![
                ("/dev/null", "/var/run/nvidia-container-devices/GPU-A"),
                ("/dev/null", "/var/run/nvidia-container-devices/GPU-B"),
            ]
        );
        assert_eq!(allocation.mounts.len(), 4);
    }

    #[test]
    fn allocation_converts_to_protocol_response() {
        let allocation = handler(Exposure::EnvVar)
            .allocate_container(&ids(&["GPU-A__1"]))
            .expect("should allocate");

        let response = v1beta1::ContainerAllocateResponse::from(allocation);
        assert_eq!(response.mounts.len(), 2);
        assert_eq!(response.mounts[0].container_path, "/usr/lib/libnvshare.so");
        assert!(response.devices.is_empty());
    }
}
