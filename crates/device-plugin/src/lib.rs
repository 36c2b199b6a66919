pub mod allocation;
pub mod config;
pub mod context;
pub mod inventory;
pub mod k8s;
pub mod slot;
pub mod supervisor;
pub mod watchers;
