use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "civpds", about = "civpds personal data server", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Node configuration file (TOML).
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the node
    Serve(ServeArgs),
    /// Create an account with a fresh signing key and profile
    InitActor(InitActorArgs),
    /// Merge an actor's shards into one
    Compact(CompactArgs),
    /// Write an actor's repository as a CAR file
    Export(ExportArgs),
    /// Show node configuration
    Config(ConfigArgs),
}

#[derive(Args)]
pub struct ServeArgs {
    /// Override `server.bind`.
    #[arg(long)]
    pub bind: Option<SocketAddr>,
    /// Override `storage.data_dir`.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
}

#[derive(Args)]
pub struct InitActorArgs {
    #[arg(long)]
    pub actor: u64,
    #[arg(long)]
    pub handle: String,
    #[arg(long, default_value = "")]
    pub display_name: String,
    /// Public URL of this node.
    #[arg(long, default_value = "http://127.0.0.1:2583")]
    pub endpoint: String,
}

#[derive(Args)]
pub struct CompactArgs {
    /// Compact every actor over the threshold when omitted.
    #[arg(long)]
    pub actor: Option<u64>,
    /// Defaults to `storage.compact_min_shards`.
    #[arg(long)]
    pub min_shards: Option<i64>,
}

#[derive(Args)]
pub struct ExportArgs {
    #[arg(long)]
    pub actor: u64,
    #[arg(short, long)]
    pub out: PathBuf,
    /// Only include commits at or after this rev.
    #[arg(long)]
    pub since: Option<String>,
}

#[derive(Args)]
pub struct ConfigArgs {
    /// Print the default configuration instead of the loaded one.
    #[arg(long)]
    pub print_default: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compact_with_global_config() {
        let cli = Cli::try_parse_from([
            "civpds",
            "compact",
            "--min-shards",
            "3",
            "--config",
            "node.toml",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("node.toml")));
        match cli.command {
            Command::Compact(args) => {
                assert_eq!(args.min_shards, Some(3));
                assert!(args.actor.is_none());
            }
            _ => panic!("expected compact"),
        }
    }

    #[test]
    fn export_requires_actor_and_out() {
        assert!(Cli::try_parse_from(["civpds", "export", "--actor", "1"]).is_err());
        assert!(Cli::try_parse_from(["civpds", "export", "--actor", "1", "--out", "a.car"]).is_ok());
    }

    #[test]
    fn config_flag() {
        let cli = Cli::try_parse_from(["civpds", "config", "--print-default"]).unwrap();
        assert!(matches!(cli.command, Command::Config(ConfigArgs { print_default: true })));
    }
}
