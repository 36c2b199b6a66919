use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use clap::Parser;
use clap::Subcommand;
use utils::version;

use crate::allocation::WorkloadPaths;
use crate::inventory::VIRTUAL_DEVICES_ENV;
use crate::k8s::EndpointConfig;

/// Extended resource name the slots are advertised under
pub const DEFAULT_RESOURCE_NAME: &str = "nvshare.com/gpu";

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Advertise virtual accelerator slots to the kubelet
    Daemon(DaemonArgs),
    /// Print the detected accelerators and slots as JSON
    Inspect(InventoryArgs),
}

#[derive(Args, Debug, Clone)]
pub struct InventoryArgs {
    #[arg(
        long,
        env = VIRTUAL_DEVICES_ENV,
        help = "Number of virtual slots advertised per physical accelerator"
    )]
    pub virtual_devices: Option<String>,
}

#[derive(Parser, Debug, Clone)]
pub struct DaemonArgs {
    #[command(flatten)]
    pub inventory: InventoryArgs,

    #[arg(
        long,
        env = "NVSHARE_RESOURCE_NAME",
        default_value = DEFAULT_RESOURCE_NAME,
        help = "Extended resource name registered with the kubelet"
    )]
    pub resource_name: String,

    #[arg(
        long,
        value_hint = clap::ValueHint::DirPath,
        default_value = api_types::DEVICE_PLUGIN_PATH,
        help = "Directory shared with the kubelet for device plugin sockets"
    )]
    pub device_plugin_dir: PathBuf,

    #[arg(
        long,
        default_value = "nvshare-device-plugin.sock",
        help = "File name of this plugin's socket inside the device plugin directory"
    )]
    pub socket_name: String,

    #[arg(
        long,
        default_value = api_types::KUBELET_SOCKET_NAME,
        help = "File name of the kubelet registration socket inside the device plugin directory"
    )]
    pub kubelet_socket_name: String,

    #[arg(
        long,
        default_value = "5",
        help = "Seconds to wait for the plugin socket and for kubelet registration"
    )]
    pub dial_timeout_secs: u64,

    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        default_value = "/var/run/nvshare/libnvshare.so",
        help = "Host path of the interposition library"
    )]
    pub lib_host_path: String,

    #[arg(
        long,
        default_value = "/usr/lib/libnvshare.so",
        help = "Path the interposition library is mounted at inside containers"
    )]
    pub lib_container_path: String,

    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        default_value = "/var/run/nvshare/scheduler.sock",
        help = "Host path of the scheduler socket"
    )]
    pub scheduler_socket_host_path: String,

    #[arg(
        long,
        default_value = "/var/run/nvshare/scheduler.sock",
        help = "Path the scheduler socket is mounted at inside containers"
    )]
    pub scheduler_socket_container_path: String,
}

impl DaemonArgs {
    pub fn endpoint_config(&self) -> EndpointConfig {
        EndpointConfig {
            device_plugin_dir: self.device_plugin_dir.clone(),
            socket_name: self.socket_name.clone(),
            kubelet_socket_name: self.kubelet_socket_name.clone(),
            dial_timeout: Duration::from_secs(self.dial_timeout_secs),
        }
    }

    pub fn workload_paths(&self) -> WorkloadPaths {
        WorkloadPaths {
            lib_host_path: self.lib_host_path.clone(),
            lib_container_path: self.lib_container_path.clone(),
            scheduler_socket_host_path: self.scheduler_socket_host_path.clone(),
            scheduler_socket_container_path: self.scheduler_socket_container_path.clone(),
        }
    }
}
