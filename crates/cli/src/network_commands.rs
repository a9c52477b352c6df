use std::process::ExitCode;

use {
    anyhow::Result,
    botbox_config::{BotboxConfig, VmMode},
    botbox_runtime::{ContainerdRuntime, RuntimeService},
    clap::Subcommand,
};

/// Invoked inside the VM by the host's delegated network strategy, so these
/// always act on the local CNI setup.
#[derive(Subcommand)]
pub enum NetworkAction {
    /// Attach a running container's task to the bot network.
    Setup { container_id: String },
    /// Release a container's network attachment.
    Remove { container_id: String },
}

pub async fn handle_network(mut config: BotboxConfig, action: NetworkAction) -> Result<ExitCode> {
    config.vm.enabled = VmMode::Off;
    let runtime = ContainerdRuntime::new(&config);
    let result = match &action {
        NetworkAction::Setup { container_id } => runtime.setup_network(container_id).await,
        NetworkAction::Remove { container_id } => runtime.remove_network(container_id).await,
    };
    // The caller matches on stderr text (duplicate allocations in particular).
    if let Err(e) = result {
        eprintln!("{e}");
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}
