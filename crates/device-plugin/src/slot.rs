//! Virtual slot identifiers.
//!
//! Every physical accelerator is advertised as `V` virtual slots. A slot is
//! externalized as `"<accelerator-id>__<ordinal>"` with a 1-based ordinal,
//! e.g. `GPU-6f3c...__2`.

use std::num::NonZeroU32;

use api_types::v1beta1;
use serde::Serialize;

/// Separator between the accelerator id and the slot ordinal
pub const SLOT_ID_SEPARATOR: &str = "__";

/// A slot identifier could not be split back into accelerator id and ordinal.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
#[display("malformed slot id: {id}")]
pub struct MalformedSlotId {
    pub id: String,
}

impl core::error::Error for MalformedSlotId {}

/// One virtual slot of a physical accelerator
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Slot {
    pub accelerator_id: String,
    pub ordinal: NonZeroU32,
}

impl Slot {
    pub fn new(accelerator_id: impl Into<String>, ordinal: NonZeroU32) -> Self {
        Self {
            accelerator_id: accelerator_id.into(),
            ordinal,
        }
    }

    /// identifier advertised to the kubelet
    pub fn id(&self) -> String {
        format_slot_id(&self.accelerator_id, self.ordinal)
    }
}

pub fn format_slot_id(accelerator_id: &str, ordinal: NonZeroU32) -> String {
    format!("{accelerator_id}{SLOT_ID_SEPARATOR}{ordinal}")
}

/// Split a slot identifier into its accelerator id and ordinal.
///
/// The split happens at the last separator, so the accelerator id is
/// returned exactly as it was formatted.
pub fn parse_slot_id(id: &str) -> Result<(&str, NonZeroU32), MalformedSlotId> {
    let malformed = || MalformedSlotId { id: id.to_string() };

    let (accelerator_id, ordinal) = id.rsplit_once(SLOT_ID_SEPARATOR).ok_or_else(malformed)?;
    if accelerator_id.is_empty() || !ordinal.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed());
    }
    let ordinal = ordinal.parse::<NonZeroU32>().map_err(|_| malformed())?;

    Ok((accelerator_id, ordinal))
}

/// Enumerate all slots, accelerator by accelerator in inventory order
pub fn enumerate_slots(accelerator_ids: &[String], slots_per_accelerator: NonZeroU32) -> Vec<Slot> {
    accelerator_ids
        .iter()
        .flat_map(|accelerator_id| {
            (1..=slots_per_accelerator.get())
                .filter_map(NonZeroU32::new)
                .map(move |ordinal| Slot::new(accelerator_id.clone(), ordinal))
        })
        .collect()
}

/// protocol representation of the advertised slots, all healthy
pub fn to_devices(slots: &[Slot]) -> Vec<v1beta1::Device> {
    slots
        .iter()
        .map(|slot| v1beta1::Device {
            id: slot.id(),
            health: api_types::HEALTHY.to_string(),
            topology: None,
        })
        .collect()
}
