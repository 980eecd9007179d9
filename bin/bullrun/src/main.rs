//! bullrun deploys and configures EVM contracts from a declarative plan.

mod cli;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use comfy_table::Table;

use bullrun_deploy::{
    ArtifactStore, ChainClient, DeploymentManifest, DeploymentPlan, DeploymentReport,
    NetworkContext, NetworksConfig, Orchestrator, QueueExecution, QueuedCall, RpcChainClient,
    ValidationScope, resolve_network_context, rpc,
};
use cli::{
    CancelQueuedArgs, CheckArgs, Cli, Command, ConfigArgs, DeployArgs, ExecuteQueuedArgs,
    ReportFormat,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize the logger.
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .init();

    match cli.command {
        Command::Deploy(args) => deploy(args).await,
        Command::Check(args) => check(args),
        Command::ExecuteQueued(args) => execute_queued(args).await,
        Command::CancelQueued(args) => cancel_queued(args).await,
    }
}

/// Connect to a configured network and wait until its endpoint answers.
async fn connect(
    config: &NetworksConfig,
    network: &str,
    ready_timeout_secs: u64,
) -> Result<RpcChainClient> {
    let settings = config.network(network)?;
    let client = RpcChainClient::new(settings.rpc_url(network)?, settings.receipt_timeout())?;

    let endpoint = &client;
    rpc::wait_until_ready(network, ready_timeout_secs, move || async move {
        endpoint.chain_id().await.map(|_| ()).map_err(anyhow::Error::from)
    })
    .await?;

    tracing::info!(network = %network, url = %client.url(), "Connected to RPC endpoint");
    Ok(client)
}

async fn deploy(args: DeployArgs) -> Result<()> {
    let config = NetworksConfig::load(&args.config.config)?;
    let plan = DeploymentPlan::load_from_file(&args.plan)?;

    let artifacts = ArtifactStore::from_dir(&args.artifacts);
    artifacts.check_plan(&plan)?;

    let client = connect(&config, &args.network, args.ready_timeout).await?;
    let context = resolve_network_context(&config, &args.network, &client).await?;
    let orchestrator = Orchestrator::new(&client, &artifacts, &context);

    match orchestrator.run_plan(&plan).await {
        Ok(report) => {
            print_report(&report, args.format);
            save_outputs(&report, &plan, context.chain_id, &args.out, true)?;
            if !report.queued().is_empty() {
                tracing::info!(
                    queued = report.queued().len(),
                    "Timelock calls queued, run `bullrun execute-queued` once their eta has passed"
                );
            }
            Ok(())
        }
        Err(failure) => {
            tracing::error!(
                step = failure.step,
                label = %failure.label,
                error = %failure.source,
                deployed = failure.report.len(),
                "Deployment halted"
            );
            if !failure.report.is_empty() || !failure.report.queued().is_empty() {
                print_report(&failure.report, args.format);
                save_outputs(&failure.report, &plan, context.chain_id, &args.out, false)?;
            }
            Err(failure.into())
        }
    }
}

fn check(args: CheckArgs) -> Result<()> {
    let plan = DeploymentPlan::load_from_file(&args.plan)?;
    let config = NetworksConfig::load(&args.config.config)?;

    let networks: Vec<String> = match args.network {
        Some(network) => vec![network],
        None => config.networks.keys().cloned().collect(),
    };
    if networks.is_empty() {
        anyhow::bail!("No networks configured in {}", args.config.config.display());
    }

    for network in &networks {
        let settings = config.network(network)?;
        let scope = ValidationScope::from_settings(network, settings);
        plan.validate(&scope)
            .with_context(|| format!("Plan `{}` is invalid on {network}", plan.name))?;
        tracing::info!(
            plan = %plan.name,
            network = %network,
            steps = plan.active_steps(scope.testnet).len(),
            contracts = plan.contract_ids(scope.testnet).len(),
            "Plan order is valid"
        );
    }

    if args.skip_artifacts {
        tracing::warn!("Skipping artifact checks");
    } else {
        ArtifactStore::from_dir(&args.artifacts).check_plan(&plan)?;
        tracing::info!(artifacts = %args.artifacts.display(), "Artifacts match the plan");
    }

    Ok(())
}

/// Load a manifest and connect to the network it was written on.
async fn open_manifest(
    config: &ConfigArgs,
    network: &str,
    path: &Path,
) -> Result<(DeploymentManifest, RpcChainClient, NetworkContext)> {
    let manifest = DeploymentManifest::load_from_file(path)?;
    if manifest.network != network {
        anyhow::bail!(
            "Manifest {} was written for network `{}`, not `{network}`",
            path.display(),
            manifest.network
        );
    }

    let config = NetworksConfig::load(&config.config)?;
    let client = connect(&config, network, rpc::DEFAULT_TIMEOUT.as_secs()).await?;
    let context = resolve_network_context(&config, network, &client).await?;
    if context.chain_id != manifest.chain_id {
        anyhow::bail!(
            "Manifest was written on chain {}, the node reports chain {}",
            manifest.chain_id,
            context.chain_id
        );
    }

    Ok((manifest, client, context))
}

async fn execute_queued(args: ExecuteQueuedArgs) -> Result<()> {
    let (manifest, client, context) =
        open_manifest(&args.config, &args.network, &args.manifest).await?;

    let now = client
        .latest_timestamp()
        .await
        .context("Failed to read the latest block timestamp")?;
    let artifacts = ArtifactStore::default();
    let orchestrator = Orchestrator::new(&client, &artifacts, &context);
    let execution = orchestrator.execute_queued(&manifest.queued, now).await?;

    print_execution(&execution, now);
    Ok(())
}

async fn cancel_queued(args: CancelQueuedArgs) -> Result<()> {
    let (manifest, client, context) =
        open_manifest(&args.config, &args.network, &args.manifest).await?;

    let selected = select_queued(&manifest.queued, &args.label)?;
    let artifacts = ArtifactStore::default();
    let orchestrator = Orchestrator::new(&client, &artifacts, &context);
    let cancelled = orchestrator.cancel_queued(&selected).await?;

    let mut table = Table::new();
    table.set_header(vec!["Cancelled call", "Transaction"]);
    for (queued, hash) in &cancelled {
        table.add_row(vec![queued.label.clone(), hash.to_string()]);
    }
    println!("{table}");
    tracing::info!(
        selected = selected.len(),
        cancelled = cancelled.len(),
        "Queued calls cancelled"
    );
    Ok(())
}

/// The queued calls named by `labels`, or all of them when none are given.
fn select_queued(queued: &[QueuedCall], labels: &[String]) -> Result<Vec<QueuedCall>> {
    if labels.is_empty() {
        return Ok(queued.to_vec());
    }
    if let Some(unknown) = labels
        .iter()
        .find(|label| !queued.iter().any(|entry| &entry.label == *label))
    {
        anyhow::bail!("No queued call labelled `{unknown}` in the manifest");
    }
    Ok(queued
        .iter()
        .filter(|entry| labels.contains(&entry.label))
        .cloned()
        .collect())
}

fn print_report(report: &DeploymentReport, format: ReportFormat) {
    match format {
        ReportFormat::Plain => println!("{report}"),
        ReportFormat::Table => {
            let mut table = Table::new();
            table.set_header(vec!["Contract", "Address", "Block", "Transaction"]);
            for record in report.records() {
                table.add_row(vec![
                    record.id().to_string(),
                    record.address().to_checksum(None),
                    record.block_number().to_string(),
                    record.transaction_hash().to_string(),
                ]);
            }
            println!("{table}");

            if !report.queued().is_empty() {
                let mut table = Table::new();
                table.set_header(vec!["Queued call", "Timelock", "Eta", "Hash"]);
                for queued in report.queued() {
                    table.add_row(vec![
                        queued.label.clone(),
                        queued.timelock.clone(),
                        queued.call.eta.to_string(),
                        queued.hash.to_string(),
                    ]);
                }
                println!("{table}");
            }
        }
    }
}

fn print_execution(execution: &QueueExecution, now: u64) {
    let mut table = Table::new();
    table.set_header(vec!["Queued call", "Status", "Detail"]);
    for (queued, hash) in &execution.executed {
        table.add_row(vec![queued.label.clone(), "executed".to_string(), hash.to_string()]);
    }
    for queued in &execution.pending {
        table.add_row(vec![
            queued.label.clone(),
            "pending".to_string(),
            format!("ready in {}s", queued.call.eta.saturating_sub(now)),
        ]);
    }
    for queued in &execution.expired {
        table.add_row(vec![
            queued.label.clone(),
            "expired".to_string(),
            format!("eta {} is past the grace period", queued.call.eta),
        ]);
    }
    for queued in &execution.not_queued {
        table.add_row(vec![
            queued.label.clone(),
            "not queued".to_string(),
            "already executed or cancelled".to_string(),
        ]);
    }
    println!("{table}");
}

/// Write the address listing and the manifest of a run.
///
/// Files of a halted run get a `.partial` suffix.
fn save_outputs(
    report: &DeploymentReport,
    plan: &DeploymentPlan,
    chain_id: u64,
    out: &Path,
    complete: bool,
) -> Result<(PathBuf, PathBuf)> {
    let listing = report.save_listing(out, &plan.name, !complete)?;
    let manifest = DeploymentManifest::new(report, plan, chain_id, complete)?.save_to_dir(out)?;
    Ok((listing, manifest))
}
