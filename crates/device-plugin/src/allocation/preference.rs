//! Least-loaded-first slot preference.
//!
//! The kubelet asks which of the available slots it should hand to a
//! container. Slots are grouped by their physical accelerator and taken from
//! the accelerator with the fewest slots handed out so far, so that new
//! containers spread across the node's accelerators instead of packing onto
//! the first one.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;
use tracing::info;
use tracing::warn;

use super::tracker::increment_in;
use super::tracker::AllocationTracker;
use crate::slot::parse_slot_id;

/// slots of one accelerator, in the order they were offered
#[derive(Debug)]
struct AcceleratorGroup<'a> {
    accelerator_id: &'a str,
    slot_ids: Vec<&'a str>,
}

#[derive(Debug, Clone)]
pub struct PreferenceEngine {
    tracker: Arc<AllocationTracker>,
}

impl PreferenceEngine {
    pub fn new(tracker: Arc<AllocationTracker>) -> Self {
        Self { tracker }
    }

    pub fn tracker(&self) -> &Arc<AllocationTracker> {
        &self.tracker
    }

    /// Choose up to `size` slots out of `available`.
    ///
    /// Slots listed in `must_include` (and present in `available`) come first.
    /// Every chosen slot bumps its accelerator's count, and the bumps are kept
    /// even if the kubelet ends up allocating something else. Fewer than
    /// `size` slots are returned when not enough are available.
    pub fn preferred_allocation(
        &self,
        available: &[String],
        must_include: &[String],
        size: usize,
    ) -> Vec<String> {
        info!(
            "preferred allocation: want {} slots from {} available",
            size,
            available.len()
        );

        let (groups, accelerator_of) = group_by_accelerator(available);

        // ranking and increments see a consistent view across concurrent calls
        let mut counts = self.tracker.lock();
        let mut chosen: Vec<String> = Vec::with_capacity(size.min(accelerator_of.len()));
        let mut taken: HashSet<&str> = HashSet::new();

        for slot_id in must_include {
            if chosen.len() >= size {
                break;
            }
            let Some(accelerator_id) = accelerator_of.get(slot_id.as_str()) else {
                warn!("must-include slot {slot_id} is not available, ignoring it");
                continue;
            };
            if taken.insert(slot_id.as_str()) {
                let count = increment_in(&mut counts, accelerator_id);
                debug!("selected required slot {slot_id} (accelerator {accelerator_id} now has {count})");
                chosen.push(slot_id.clone());
            }
        }

        let mut ranked: Vec<&AcceleratorGroup<'_>> = groups.iter().collect();
        // stable: equal loads keep the order accelerators were first offered in
        ranked.sort_by_key(|group| counts.get(group.accelerator_id).copied().unwrap_or(0));

        'groups: for group in ranked {
            for &slot_id in &group.slot_ids {
                if chosen.len() >= size {
                    break 'groups;
                }
                if !taken.insert(slot_id) {
                    continue;
                }
                let count = increment_in(&mut counts, group.accelerator_id);
                debug!(
                    "selected slot {slot_id} (accelerator {} now has {count})",
                    group.accelerator_id
                );
                chosen.push(slot_id.to_string());
            }
        }

        if chosen.len() < size {
            warn!(
                "preferred allocation is short: {} of {} slots available",
                chosen.len(),
                size
            );
        }
        chosen
    }
}

/// Group parseable slot ids by accelerator, dropping malformed and repeated ids.
fn group_by_accelerator(
    available: &[String],
) -> (Vec<AcceleratorGroup<'_>>, HashMap<&str, &str>) {
    let mut groups: Vec<AcceleratorGroup<'_>> = Vec::new();
    let mut group_index: HashMap<&str, usize> = HashMap::new();
    let mut accelerator_of: HashMap<&str, &str> = HashMap::new();

    for slot_id in available {
        let accelerator_id = match parse_slot_id(slot_id) {
            Ok((accelerator_id, _)) => accelerator_id,
            Err(e) => {
                warn!("dropping unexpected slot id from available list: {e}");
                continue;
            }
        };
        if accelerator_of.insert(slot_id.as_str(), accelerator_id).is_some() {
            continue;
        }

        let index = *group_index.entry(accelerator_id).or_insert_with(|| {
            groups.push(AcceleratorGroup {
                accelerator_id,
                slot_ids: Vec::new(),
            });
            groups.len() - 1
        });
        groups[index].slot_ids.push(slot_id.as_str());
    }

    (groups, accelerator_of)
}
