use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use device_plugin::allocation::WorkloadPaths;
use device_plugin::config::Cli;
use device_plugin::config::Commands;
use device_plugin::config::DaemonArgs;
use device_plugin::config::DEFAULT_RESOURCE_NAME;
use device_plugin::config::InventoryArgs;
use device_plugin::context::PluginContext;
use device_plugin::inventory::Inventory;
use device_plugin::supervisor::Supervisor;
use device_plugin::watchers;
use serde::Serialize;
use utils::logging;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon(daemon_args) => run_daemon(daemon_args).await,
        Commands::Inspect(inventory_args) => run_inspect(inventory_args),
    }
}

async fn run_daemon(daemon_args: DaemonArgs) -> Result<()> {
    let _guard = logging::init();

    tracing::info!("Starting device plugin {}", &**version::VERSION);

    let inventory = Inventory::from_env(daemon_args.inventory.virtual_devices.as_deref())
        .map_err(|report| anyhow::anyhow!("{report:?}"))
        .context("failed to detect accelerators")?;

    let config = daemon_args.endpoint_config();
    let context = PluginContext::new(
        daemon_args.resource_name.clone(),
        inventory,
        daemon_args.workload_paths(),
    );
    tracing::info!(
        "found {} {} accelerators, advertising {} slots as '{}'",
        context.inventory.accelerator_ids.len(),
        context.inventory.backend,
        context.slots.len(),
        context.resource_name
    );
    let supervisor = Supervisor::new(context, config.clone());

    // dropping the watcher ends filesystem notifications
    let _watcher = watchers::watch_kubelet_socket(&config, supervisor.events())
        .map_err(|report| anyhow::anyhow!("{report:?}"))
        .context("failed to create filesystem watcher")?;
    let _signals = watchers::spawn_signal_watcher(supervisor.events())
        .context("failed to install signal handlers")?;

    if !watchers::kubelet_socket_exists(&config) {
        tracing::warn!(
            "{} does not exist yet, registration will be retried",
            config.kubelet_socket_path().display()
        );
    }

    supervisor
        .run()
        .await
        .map_err(|report| anyhow::anyhow!("{report:?}"))
        .context("device plugin stopped")
}

#[derive(Serialize)]
struct InspectOutput<'a> {
    inventory: &'a Inventory,
    slots: Vec<String>,
}

fn run_inspect(inventory_args: InventoryArgs) -> Result<()> {
    let inventory = Inventory::from_env(inventory_args.virtual_devices.as_deref())
        .map_err(|report| anyhow::anyhow!("{report:?}"))
        .context("failed to detect accelerators")?;
    let context = PluginContext::new(
        DEFAULT_RESOURCE_NAME,
        inventory,
        WorkloadPaths::default(),
    );

    let output = InspectOutput {
        inventory: &context.inventory,
        slots: context.slots.iter().map(|slot| slot.id()).collect(),
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&output).context("failed to serialize inventory")?
    );

    Ok(())
}
