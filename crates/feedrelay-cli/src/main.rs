mod check_command;
mod run_command;

use {
    clap::{Parser, Subcommand},
    feedrelay_core::Config,
    std::path::PathBuf,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "feedrelay", about = "Feed ingestion, routing and forwarding relay")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML configuration file. Environment variables override its values.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error). Defaults to the configured level.
    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect every configured source and relay messages until interrupted.
    Run {
        /// Log outbound messages instead of sending them.
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Validate configuration and credentials, then print the routing table.
    Check,
}

fn init_telemetry(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref())?;
    init_telemetry(cli.log_level.as_deref().unwrap_or(&config.log_level));

    match cli.command {
        Commands::Run { dry_run } => run_command::run(config, dry_run).await,
        Commands::Check => check_command::check(&config),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_run_with_dry_run() {
        let cli = Cli::try_parse_from(["feedrelay", "run", "--dry-run", "--config", "relay.toml"]).unwrap();
        assert!(matches!(cli.command, Commands::Run { dry_run: true }));
        assert_eq!(cli.config, Some(PathBuf::from("relay.toml")));
        assert!(cli.log_level.is_none());
    }

    #[test]
    fn test_cli_parses_check_with_global_log_level() {
        let cli = Cli::try_parse_from(["feedrelay", "--log-level", "debug", "check"]).unwrap();
        assert!(matches!(cli.command, Commands::Check));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["feedrelay"]).is_err());
    }
}
