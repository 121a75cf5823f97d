use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "mirage", version, about = "Inspect and maintain the appearance asset cache")]
pub struct Cli {
    /// Configuration file (TOML, YAML or JSON).
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Maintain the local content cache.
    #[command(subcommand)]
    Cache(CacheCommand),
    /// Evaluate a peer's footprint against the performance thresholds.
    Gate(GateArgs),
}

#[derive(Debug, PartialEq, Eq, Subcommand)]
pub enum CacheCommand {
    /// Entry count, disk usage and how much of it is compacted.
    Stats,
    /// Check every entry's digest, removing corrupt ones.
    Verify,
    /// Compress every entry that isn't yet.
    Compact,
    /// Remove the oldest entries until the cache fits.
    Evict {
        /// Overrides `cache.max_size` from the configuration.
        #[arg(long, value_name = "BYTES")]
        max_size: Option<u64>,
    },
}

#[derive(Debug, PartialEq, Args)]
pub struct GateArgs {
    #[arg(long, value_name = "ID")]
    pub peer: String,
    /// VRAM used by the peer's appearance, in MiB.
    #[arg(long, value_name = "MIB")]
    pub vram: u64,
    /// Raw triangle count.
    #[arg(long, value_name = "N")]
    pub triangles: u64,
    #[arg(long, value_name = "H")]
    pub height: f32,
    /// Height the warn multiplier applies to.
    #[arg(long, value_name = "B", default_value_t = 1.0)]
    pub baseline: f32,
    /// Peer is paired individually rather than through a group.
    #[arg(long)]
    pub direct: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use rstest::rstest;

    #[test]
    fn test_command_definition() {
        Cli::command().debug_assert();
    }

    #[rstest]
    #[case(&["mirage", "cache", "stats"], CacheCommand::Stats)]
    #[case(&["mirage", "cache", "verify"], CacheCommand::Verify)]
    #[case(&["mirage", "cache", "compact"], CacheCommand::Compact)]
    #[case(&["mirage", "cache", "evict"], CacheCommand::Evict { max_size: None })]
    #[case(&["mirage", "cache", "evict", "--max-size", "1024"], CacheCommand::Evict { max_size: Some(1024) })]
    fn test_cache_commands(#[case] args: &[&str], #[case] expected: CacheCommand) {
        let cli = Cli::try_parse_from(args).unwrap();
        assert!(matches!(cli.command, Command::Cache(command) if command == expected));
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["mirage", "cache", "stats", "-v", "--config", "/etc/mirage.toml"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/mirage.toml")));
    }

    #[test]
    fn test_gate_arguments() {
        let cli = Cli::try_parse_from([
            "mirage", "gate", "--peer", "abc", "--vram", "400", "--triangles", "120000", "--height", "3.5", "--direct",
        ])
        .unwrap();
        let Command::Gate(args) = cli.command else {
            panic!("expected gate command");
        };
        assert_eq!(
            args,
            GateArgs {
                peer: "abc".to_string(),
                vram: 400,
                triangles: 120_000,
                height: 3.5,
                baseline: 1.0,
                direct: true,
            }
        );
    }

    #[test]
    fn test_gate_requires_footprint() {
        assert!(Cli::try_parse_from(["mirage", "gate", "--peer", "abc"]).is_err());
    }
}
