use std::{process::ExitCode, time::Duration};

use {
    anyhow::{Result, bail},
    botbox_bots::ExecCommand,
    botbox_config::BotboxConfig,
    botbox_runtime::ExecStreams,
    clap::Args,
};

#[derive(Args)]
pub struct ExecArgs {
    bot: String,
    /// Working directory inside the container.
    #[arg(long)]
    workdir: Option<String>,
    /// Environment override, repeatable.
    #[arg(long = "env", value_name = "K=V")]
    env: Vec<String>,
    /// Allocate a TTY.
    #[arg(long)]
    tty: bool,
    /// Kill the command after this many seconds.
    #[arg(long)]
    timeout: Option<u64>,
    /// Command and arguments.
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

fn parse_env(pairs: &[String]) -> Result<Vec<(String, String)>> {
    pairs
        .iter()
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
            _ => bail!("invalid --env {pair:?}, expected K=V"),
        })
        .collect()
}

pub async fn start(config: &BotboxConfig, bot: &str) -> Result<()> {
    let manager = crate::manager(config).await?;
    let task = manager.start(bot).await?;
    match task.pid {
        Some(pid) => println!("{bot}: running (pid {pid})"),
        None => println!("{bot}: running"),
    }
    Ok(())
}

pub async fn stop(config: &BotboxConfig, bot: &str, timeout: Option<u64>) -> Result<()> {
    let manager = crate::manager(config).await?;
    manager.stop(bot, timeout.map(Duration::from_secs)).await?;
    println!("{bot}: stopped");
    Ok(())
}

pub async fn delete(config: &BotboxConfig, bot: &str) -> Result<()> {
    let manager = crate::manager(config).await?;
    manager.delete(bot).await?;
    println!("{bot}: deleted");
    Ok(())
}

pub async fn status(config: &BotboxConfig, bot: &str, json: bool) -> Result<()> {
    let manager = crate::manager(config).await?;
    let container = manager.get_container(bot).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&container)?);
        return Ok(());
    }
    println!("Bot:        {bot}");
    println!("Container:  {}", container.info.id);
    println!("Status:     {}", container.status());
    println!("Image:      {}", container.info.image);
    println!(
        "Snapshot:   {} ({})",
        container.info.snapshot_key, container.info.snapshotter
    );
    if let Some(pid) = container.task.as_ref().and_then(|t| t.pid) {
        println!("PID:        {pid}");
    }
    for mount in &container.info.mounts {
        println!(
            "Mount:      {} -> {}{}",
            mount.source.display(),
            mount.destination,
            if mount.read_only {
                " (ro)"
            } else {
                ""
            }
        );
    }
    Ok(())
}

/// Process exit status for a command's exit code. Codes outside `1..=255`
/// still report failure.
pub(crate) fn exit_status(code: i32) -> ExitCode {
    if code == 0 {
        return ExitCode::SUCCESS;
    }
    ExitCode::from(u8::try_from(code).ok().filter(|c| *c != 0).unwrap_or(1))
}

pub async fn exec(config: &BotboxConfig, args: ExecArgs) -> Result<ExitCode> {
    let manager = crate::manager(config).await?;
    let command = ExecCommand {
        args: args.command,
        env: parse_env(&args.env)?,
        workdir: args.workdir,
        terminal: args.tty,
        timeout: args.timeout.map(Duration::from_secs),
    };
    let code = manager
        .exec(&args.bot, &command, ExecStreams::inherit())
        .await?;
    Ok(exit_status(code))
}

pub async fn events(config: &BotboxConfig, bot: &str, limit: Option<usize>) -> Result<()> {
    let manager = crate::manager(config).await?;
    let events = manager.list_events(bot, limit).await?;
    if events.is_empty() {
        println!("No events for {bot}.");
        return Ok(());
    }
    for event in &events {
        println!(
            "{:>6}  {:<18} {:<16} {}",
            event.id, event.created_at_ms, event.kind, event.payload
        );
    }
    Ok(())
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_pairs_parse() {
        let env = parse_env(&["A=1".into(), "B=x=y".into(), "C=".into()]).unwrap();
        assert_eq!(env, vec![
            ("A".to_string(), "1".to_string()),
            ("B".to_string(), "x=y".to_string()),
            ("C".to_string(), String::new()),
        ]);
        assert!(parse_env(&["novalue".into()]).is_err());
        assert!(parse_env(&["=1".into()]).is_err());
    }

    #[test]
    fn exit_status_keeps_failure() {
        assert_eq!(exit_status(0), ExitCode::SUCCESS);
        assert_eq!(exit_status(3), ExitCode::from(3));
        assert_eq!(exit_status(137), ExitCode::from(137));
        assert_eq!(exit_status(256), ExitCode::from(1));
        assert_eq!(exit_status(-1), ExitCode::from(1));
    }
}
