use {anyhow::Result, botbox_config::BotboxConfig, clap::Subcommand};

#[derive(Subcommand)]
pub enum VersionAction {
    /// List a bot's versions, newest first.
    List { bot: String },
    /// Commit the bot's current filesystem as a new version.
    Create { bot: String },
    /// Recreate the bot's container from an earlier version.
    Rollback { bot: String, version: i64 },
}

pub async fn handle_versions(config: &BotboxConfig, action: VersionAction) -> Result<()> {
    let manager = crate::manager(config).await?;
    match action {
        VersionAction::List { bot } => {
            let versions = manager.list_versions(&bot).await?;
            if versions.is_empty() {
                println!("No versions for {bot}.");
                return Ok(());
            }
            println!("{:>8}  {:<48} CREATED (ms)", "VERSION", "SNAPSHOT");
            for v in &versions {
                println!(
                    "{:>8}  {:<48} {}",
                    v.version, v.snapshot_name, v.created_at_ms
                );
            }
        },
        VersionAction::Create { bot } => {
            let v = manager.create_version(&bot).await?;
            println!("{bot}: version {} ({})", v.version, v.snapshot_name);
        },
        VersionAction::Rollback { bot, version } => {
            manager.rollback_version(&bot, version).await?;
            println!("{bot}: rolled back to version {version}");
        },
    }
    Ok(())
}
