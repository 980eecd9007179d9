use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tracing::level_filters::LevelFilter;

/// Default location of the network settings.
pub const DEFAULT_CONFIG: &str = "config/networks.toml";
/// Default plan file.
pub const DEFAULT_PLAN: &str = "plans/bull.toml";
/// Default directory of compiled artifacts (truffle layout).
pub const DEFAULT_ARTIFACTS: &str = "build/contracts";
/// Default directory reports are written to.
pub const DEFAULT_OUT: &str = "addresses deployed";

/// How deployed contracts are printed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum ReportFormat {
    #[default]
    Table,
    /// `<identifier> <address>` lines, as written to the listing file.
    Plain,
}

#[derive(Parser)]
#[command(name = "bullrun")]
#[command(
    author,
    version,
    about = "Deploy and configure EVM contracts from a declarative plan"
)]
pub struct Cli {
    /// The verbosity level.
    #[arg(
        short,
        long,
        global = true,
        env = "BULLRUN_VERBOSITY",
        default_value_t = LevelFilter::INFO
    )]
    pub verbosity: LevelFilter,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a plan against a network and write the address listing.
    Deploy(DeployArgs),
    /// Validate a plan and its artifacts without touching a network.
    Check(CheckArgs),
    /// Execute timelock calls queued by an earlier run, once their eta has passed.
    ExecuteQueued(ExecuteQueuedArgs),
    /// Cancel timelock calls queued by an earlier run.
    CancelQueued(CancelQueuedArgs),
}

/// Files shared by every command.
#[derive(Debug, Clone, Args)]
pub struct ConfigArgs {
    /// The network settings file.
    ///
    /// Values can be overridden with `BULLRUN_NETWORKS__<NAME>__<KEY>` variables.
    #[arg(long, env = "BULLRUN_CONFIG", default_value = DEFAULT_CONFIG)]
    pub config: PathBuf,
}

#[derive(Debug, Clone, Args)]
pub struct DeployArgs {
    /// The network to deploy to, as named in the settings file.
    #[arg(short, long, env = "BULLRUN_NETWORK")]
    pub network: String,

    /// The plan to run.
    #[arg(short, long, env = "BULLRUN_PLAN", default_value = DEFAULT_PLAN)]
    pub plan: PathBuf,

    /// Directory holding `<Contract>.json` artifacts.
    #[arg(short, long, env = "BULLRUN_ARTIFACTS", default_value = DEFAULT_ARTIFACTS)]
    pub artifacts: PathBuf,

    /// Directory the listing and manifest are written to.
    #[arg(short, long, env = "BULLRUN_OUT", default_value = DEFAULT_OUT)]
    pub out: PathBuf,

    /// How long to wait for the RPC endpoint to answer, in seconds.
    #[arg(long, env = "BULLRUN_READY_TIMEOUT", default_value_t = 60)]
    pub ready_timeout: u64,

    /// How deployed contracts are printed.
    #[arg(long, env = "BULLRUN_FORMAT", default_value_t = ReportFormat::Table)]
    pub format: ReportFormat,

    #[clap(flatten)]
    pub config: ConfigArgs,
}

#[derive(Debug, Clone, Args)]
pub struct CheckArgs {
    /// Apply this network's parameters, roles and conditions.
    ///
    /// If not provided, the plan is checked against every configured network.
    #[arg(short, long, env = "BULLRUN_NETWORK")]
    pub network: Option<String>,

    /// The plan to check.
    #[arg(short, long, env = "BULLRUN_PLAN", default_value = DEFAULT_PLAN)]
    pub plan: PathBuf,

    /// Directory holding `<Contract>.json` artifacts.
    #[arg(short, long, env = "BULLRUN_ARTIFACTS", default_value = DEFAULT_ARTIFACTS)]
    pub artifacts: PathBuf,

    /// Only check the plan's ordering, not its artifacts.
    #[arg(long, env = "BULLRUN_SKIP_ARTIFACTS")]
    pub skip_artifacts: bool,

    #[clap(flatten)]
    pub config: ConfigArgs,
}

#[derive(Debug, Clone, Args)]
pub struct ExecuteQueuedArgs {
    /// The network the calls were queued on.
    #[arg(short, long, env = "BULLRUN_NETWORK")]
    pub network: String,

    /// Manifest written by `bullrun deploy`.
    #[arg(short, long, env = "BULLRUN_MANIFEST")]
    pub manifest: PathBuf,

    #[clap(flatten)]
    pub config: ConfigArgs,
}

#[derive(Debug, Clone, Args)]
pub struct CancelQueuedArgs {
    /// The network the calls were queued on.
    #[arg(short, long, env = "BULLRUN_NETWORK")]
    pub network: String,

    /// Manifest written by `bullrun deploy`.
    #[arg(short, long, env = "BULLRUN_MANIFEST")]
    pub manifest: PathBuf,

    /// Only cancel calls with this label. Repeat to cancel several.
    ///
    /// If not provided, every call still queued is cancelled.
    #[arg(short, long)]
    pub label: Vec<String>,

    #[clap(flatten)]
    pub config: ConfigArgs,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_deploy() {
        let cli = Cli::try_parse_from(["bullrun", "deploy", "--network", "bsc_testnet"]).unwrap();
        assert_eq!(cli.verbosity, LevelFilter::INFO);
        match cli.command {
            Command::Deploy(args) => {
                assert_eq!(args.network, "bsc_testnet");
                assert_eq!(args.plan, PathBuf::from(DEFAULT_PLAN));
                assert_eq!(args.out, PathBuf::from(DEFAULT_OUT));
                assert_eq!(args.format, ReportFormat::Table);
                assert_eq!(args.config.config, PathBuf::from(DEFAULT_CONFIG));
            }
            other => panic!("expected deploy, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_execute_queued() {
        let cli = Cli::try_parse_from([
            "bullrun",
            "-v",
            "debug",
            "execute-queued",
            "--network",
            "develop",
            "--manifest",
            "addresses deployed/develop governance.json",
        ])
        .unwrap();
        assert_eq!(cli.verbosity, LevelFilter::DEBUG);
        assert!(matches!(cli.command, Command::ExecuteQueued(_)));
    }

    #[test]
    fn test_parse_cancel_queued() {
        let cli = Cli::try_parse_from([
            "bullrun",
            "cancel-queued",
            "-n",
            "bsc_mainnet",
            "-m",
            "addresses deployed/bsc_mainnet governance.json",
            "--label",
            "BULL pool",
        ])
        .unwrap();
        match cli.command {
            Command::CancelQueued(args) => {
                assert_eq!(args.network, "bsc_mainnet");
                assert_eq!(args.label, vec!["BULL pool".to_string()]);
            }
            other => panic!("expected cancel-queued, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_check_and_format() {
        let cli = Cli::try_parse_from(["bullrun", "check", "--skip-artifacts"]).unwrap();
        match cli.command {
            Command::Check(args) => {
                assert!(args.network.is_none());
                assert!(args.skip_artifacts);
            }
            other => panic!("expected check, got {other:?}"),
        }

        assert_eq!("plain".parse::<ReportFormat>().unwrap(), ReportFormat::Plain);
        assert!(Cli::try_parse_from(["bullrun", "deploy"]).is_err());
    }
}
