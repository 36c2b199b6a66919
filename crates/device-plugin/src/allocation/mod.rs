//! Slot allocation: which slots to prefer and what an allocated container gets.

pub mod handler;
pub mod preference;
pub mod tracker;

pub use handler::AllocationError;
pub use handler::AllocationHandler;
pub use handler::ContainerAllocation;
pub use handler::WorkloadPaths;
pub use preference::PreferenceEngine;
pub use tracker::AllocationTracker;
