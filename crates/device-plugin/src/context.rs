use std::sync::Arc;

use api_types::v1beta1;
use tracing::info;

use crate::allocation::AllocationHandler;
use crate::allocation::AllocationTracker;
use crate::allocation::PreferenceEngine;
use crate::allocation::WorkloadPaths;
use crate::inventory::Inventory;
use crate::slot::enumerate_slots;
use crate::slot::to_devices;
use crate::slot::Slot;

/// State shared by every protocol endpoint instance for the process lifetime
#[derive(Debug)]
pub struct PluginContext {
    /// resource name registered with the kubelet (e.g. "nvshare.com/gpu")
    pub resource_name: String,
    pub inventory: Inventory,
    pub slots: Vec<Slot>,
    /// advertised slots in protocol form
    pub devices: Vec<v1beta1::Device>,
    pub preference: PreferenceEngine,
    pub allocation: AllocationHandler,
}

impl PluginContext {
    pub fn new(
        resource_name: impl Into<String>,
        inventory: Inventory,
        workload_paths: WorkloadPaths,
    ) -> Arc<Self> {
        let slots = enumerate_slots(&inventory.accelerator_ids, inventory.slots_per_accelerator);

        info!("reporting the following device ids to kubelet:");
        for slot in &slots {
            info!("[{}] device id: {}", slot.ordinal, slot.id());
        }

        let devices = to_devices(&slots);
        let allocation = AllocationHandler::new(&slots, &inventory, workload_paths);
        let preference = PreferenceEngine::new(Arc::new(AllocationTracker::new()));

        Arc::new(Self {
            resource_name: resource_name.into(),
            inventory,
            slots,
            devices,
            preference,
            allocation,
        })
    }
}
