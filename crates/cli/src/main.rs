mod bot_commands;
mod config_commands;
mod network_commands;
mod version_commands;

use std::{path::PathBuf, process::ExitCode, sync::Arc};

use {
    anyhow::{Context, Result},
    botbox_bots::{BotManager, ManagerConfig},
    botbox_config::BotboxConfig,
    botbox_store::SqliteStore,
    clap::{Parser, Subcommand},
    tracing::{debug, info},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "botbox", about = "botbox: per-bot sandbox containers", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: discover botbox.{toml,yaml,yml,json}).
    #[arg(long, global = true, env = "BOTBOX_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Print recorded metrics in Prometheus format on exit.
    #[arg(long, global = true, default_value_t = false)]
    print_metrics: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create (if needed) and start a bot's container.
    Start { bot: String },
    /// Stop a bot's task.
    Stop {
        bot: String,
        /// Seconds to wait before killing (default: runtime.stop_timeout_secs).
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Delete a bot's container. Versions are kept.
    Delete { bot: String },
    /// Show a bot's container and task.
    Status {
        bot: String,
        #[arg(long)]
        json: bool,
    },
    /// Run a command inside a bot's container.
    Exec(bot_commands::ExecArgs),
    /// Version history.
    Versions {
        #[command(subcommand)]
        action: version_commands::VersionAction,
    },
    /// Show a bot's lifecycle events.
    Events {
        bot: String,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Attach or detach container networking (privileged; runs where the
    /// runtime's namespaces are visible).
    Network {
        #[command(subcommand)]
        action: network_commands::NetworkAction,
    },
    /// Configuration checks.
    Config {
        #[command(subcommand)]
        action: config_commands::ConfigAction,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

/// Build the bot manager over the configured runtime and store.
pub(crate) async fn manager(config: &BotboxConfig) -> Result<BotManager> {
    let runtime = botbox_runtime::create_runtime(config)?;
    std::fs::create_dir_all(&config.storage.data_root).with_context(|| {
        format!(
            "failed to create data root {}",
            config.storage.data_root.display()
        )
    })?;
    let store = SqliteStore::new(&config.storage.database_url)
        .await
        .with_context(|| format!("failed to open {}", config.storage.database_url))?;
    debug!(backend = runtime.backend_name(), "bot manager ready");
    Ok(BotManager::new(
        runtime,
        Arc::new(store),
        ManagerConfig::from(config),
    ))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    let metrics = botbox_metrics::init_metrics(&[(
        "version".to_string(),
        env!("CARGO_PKG_VERSION").to_string(),
    )])?;

    let config = botbox_config::load_or_discover(cli.config.as_deref())?;
    info!(version = env!("CARGO_PKG_VERSION"), "botbox starting");

    let done = |r: Result<()>| r.map(|()| ExitCode::SUCCESS);
    let result = match cli.command {
        Commands::Start { bot } => done(bot_commands::start(&config, &bot).await),
        Commands::Stop { bot, timeout } => done(bot_commands::stop(&config, &bot, timeout).await),
        Commands::Delete { bot } => done(bot_commands::delete(&config, &bot).await),
        Commands::Status { bot, json } => done(bot_commands::status(&config, &bot, json).await),
        Commands::Exec(args) => bot_commands::exec(&config, args).await,
        Commands::Versions { action } => {
            done(version_commands::handle_versions(&config, action).await)
        },
        Commands::Events { bot, limit } => done(bot_commands::events(&config, &bot, limit).await),
        Commands::Network { action } => network_commands::handle_network(config, action).await,
        Commands::Config { action } => config_commands::handle_config(&config, action),
    };

    // Printed on every outcome, including failed and nonzero-exit commands.
    if cli.print_metrics {
        eprint!("{}", metrics.render());
    }
    result
}
