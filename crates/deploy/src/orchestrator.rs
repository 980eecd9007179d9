//! Runs deployment plans against a chain, one step at a time.

use alloy_core::primitives::{Address, B256, Bytes, U256};
use anyhow::Context;

use crate::{
    ArgExpr, ArtifactStore, ChainClient, ChainError, ConfigurationStep, ContractSpec,
    DeployedContractRecord, DeploymentPlan, DeploymentReport, NetworkContext, OrchestratorError,
    QueuedCall, RunFailure, Step, TransactionReceipt, TransactionRequest, ValidationScope,
    args::{ResolvedArg, Scope},
    plan::TimelockRoute,
    timelock::{self, TimelockCall},
};

/// Added to the timelock delay when computing an eta, so the eta still
/// satisfies the delay once the queue transaction is mined in a later block.
pub const QUEUE_ETA_MARGIN_SECS: u64 = 300;

/// What applying a configuration step did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationOutcome {
    /// The call was sent to the target and confirmed.
    Executed { transaction_hash: B256 },
    /// The call was queued on a timelock.
    Queued(QueuedCall),
}

/// Result of [`Orchestrator::execute_queued`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueExecution {
    /// Executed calls, with the hash of the executing transaction.
    pub executed: Vec<(QueuedCall, B256)>,
    /// Calls whose eta has not been reached.
    pub pending: Vec<QueuedCall>,
    /// Calls past their grace period. The timelock will never run them.
    pub expired: Vec<QueuedCall>,
    /// Calls the timelock no longer holds: executed or cancelled earlier.
    pub not_queued: Vec<QueuedCall>,
}

/// Map the chain failure of a configuration call. A mined call that failed
/// without a reason is still a revert.
fn call_error(label: &str, err: ChainError) -> OrchestratorError {
    match err {
        ChainError::Reverted { reason } => OrchestratorError::Revert { reason },
        err @ ChainError::Failed { .. } => OrchestratorError::Revert {
            reason: err.to_string(),
        },
        err => OrchestratorError::configuration(format!("{label}: {err}")),
    }
}

enum StepOutcome {
    Deployed(DeployedContractRecord),
    Configured(ConfigurationOutcome),
}

/// Executes plans against one network.
///
/// Holds no state between calls: records live in the [`DeploymentReport`]
/// handed back to the caller.
pub struct Orchestrator<'a, C> {
    client: &'a C,
    artifacts: &'a ArtifactStore,
    context: &'a NetworkContext,
}

impl<'a, C: ChainClient> Orchestrator<'a, C> {
    pub fn new(client: &'a C, artifacts: &'a ArtifactStore, context: &'a NetworkContext) -> Self {
        Self {
            client,
            artifacts,
            context,
        }
    }

    pub fn context(&self) -> &NetworkContext {
        self.context
    }

    async fn resolve_args(
        &self,
        args: &[ArgExpr],
        records: &DeploymentReport,
    ) -> Result<Vec<ResolvedArg>, String> {
        let block_number = if args.iter().any(ArgExpr::needs_block_number) {
            Some(self.client.block_number().await.map_err(|e| e.to_string())?)
        } else {
            None
        };

        let scope = Scope {
            records,
            roles: &self.context.roles,
            params: &self.context.params,
            block_number,
        };
        scope.resolve_all(args).map_err(|e| e.to_string())
    }

    /// Send a transaction and wait for it to be confirmed. Never retried.
    async fn submit(&self, mut tx: TransactionRequest) -> Result<TransactionReceipt, ChainError> {
        tx.gas = self.context.gas_limit;
        tx.gas_price = self.context.gas_price;

        let hash = self.client.send_transaction(tx).await?;
        tracing::info!(%hash, "Transaction sent, waiting for confirmation");
        let receipt = self
            .client
            .wait_for_receipt(hash, self.context.confirmations)
            .await
            .map_err(|err| match err {
                // Timeouts and failed receipts already name the transaction.
                ChainError::Rpc { message } => ChainError::rpc(format!(
                    "transaction {hash} was sent but not confirmed: {message}"
                )),
                err => err,
            })?;
        tracing::debug!(%hash, block = receipt.block_number, "Transaction confirmed");
        Ok(receipt)
    }

    /// Deploy one contract whose constructor arguments may refer to `records`.
    pub async fn deploy_contract(
        &self,
        spec: &ContractSpec,
        records: &DeploymentReport,
    ) -> Result<DeployedContractRecord, OrchestratorError> {
        let fail = |message: String| OrchestratorError::deployment(&spec.id, message);

        let from = self.context.sender(spec.from.as_deref()).map_err(&fail)?;
        let args = self.resolve_args(&spec.args, records).await.map_err(&fail)?;
        let artifact = self
            .artifacts
            .get(spec.artifact_name())
            .map_err(|e| fail(format!("{e:#}")))?;
        let data = artifact
            .encode_deployment(&args)
            .map_err(|e| fail(format!("{e:#}")))?;

        tracing::info!(
            contract = %spec.id,
            artifact = %spec.artifact_name(),
            %from,
            "Deploying contract"
        );

        let receipt = self
            .submit(TransactionRequest::create(from, data))
            .await
            .map_err(|e| fail(e.to_string()))?;
        let address = receipt.contract_address.ok_or_else(|| {
            fail(format!(
                "receipt of {} has no contract address",
                receipt.transaction_hash
            ))
        })?;

        tracing::info!(
            contract = %spec.id,
            %address,
            block = receipt.block_number,
            "Contract deployed"
        );

        Ok(DeployedContractRecord::new(
            &spec.id,
            spec.artifact_name(),
            address,
            &self.context.network,
            receipt.transaction_hash,
            receipt.block_number,
        ))
    }

    /// Call a method on a contract in `records`, directly or through a timelock.
    pub async fn apply_configuration_step(
        &self,
        step: &ConfigurationStep,
        records: &DeploymentReport,
    ) -> Result<ConfigurationOutcome, OrchestratorError> {
        let label = step.call.to_string();
        let fail =
            |message: String| OrchestratorError::configuration(format!("{label}: {message}"));
        let chain_fail = |err: ChainError| call_error(&label, err);

        let target = records.get(step.target()).ok_or_else(|| {
            fail(format!("contract `{}` is not deployed yet", step.target()))
        })?;
        let from = self.context.sender(step.from.as_deref()).map_err(&fail)?;
        let args = self.resolve_args(&step.args, records).await.map_err(&fail)?;
        let artifact = self
            .artifacts
            .get(target.artifact())
            .map_err(|e| fail(format!("{e:#}")))?;
        let call = artifact
            .encode_call(step.method(), &args)
            .map_err(|e| fail(format!("{e:#}")))?;

        let Some(route) = &step.timelock else {
            tracing::info!(
                call = %step.call,
                target = %target.address(),
                %from,
                signature = %call.signature,
                "Applying configuration step"
            );
            let receipt = self
                .submit(TransactionRequest::call(from, target.address(), call.data))
                .await
                .map_err(chain_fail)?;
            return Ok(ConfigurationOutcome::Executed {
                transaction_hash: receipt.transaction_hash,
            });
        };

        let queued = self
            .queue_on_timelock(
                step,
                route,
                target.address(),
                call.signature,
                call.params_data,
                records,
            )
            .await?;
        let tx =
            TransactionRequest::call(from, queued.timelock_address, queued.call.encode_queue());
        self.submit(tx).await.map_err(chain_fail)?;

        tracing::info!(
            call = %step.call,
            timelock = %route.contract,
            eta = queued.call.eta,
            hash = %queued.hash,
            "Configuration step queued on timelock"
        );
        Ok(ConfigurationOutcome::Queued(queued))
    }

    async fn queue_on_timelock(
        &self,
        step: &ConfigurationStep,
        route: &TimelockRoute,
        target: Address,
        signature: String,
        data: Bytes,
        records: &DeploymentReport,
    ) -> Result<QueuedCall, OrchestratorError> {
        let timelock_address = records.address(&route.contract).ok_or_else(|| {
            OrchestratorError::configuration(format!(
                "{}: timelock `{}` is not deployed yet",
                step.call, route.contract
            ))
        })?;
        let now = self.client.latest_timestamp().await.map_err(|e| {
            OrchestratorError::configuration(format!("{}: {e}", step.call))
        })?;

        let call = TimelockCall {
            target,
            value: U256::ZERO,
            signature,
            data,
            eta: now + route.delay_secs + QUEUE_ETA_MARGIN_SECS,
        };
        Ok(QueuedCall {
            label: Step::Configure(step.clone()).label(),
            timelock: route.contract.clone(),
            timelock_address,
            hash: call.hash(),
            call,
        })
    }

    /// Run every step active on the network, in order, halting on the first
    /// failure.
    ///
    /// The plan's ordering is validated before anything is sent, so a
    /// reference to a contract the plan never deploys first fails without a
    /// single transaction.
    pub async fn run_plan(&self, plan: &DeploymentPlan) -> Result<DeploymentReport, RunFailure> {
        let mut report = DeploymentReport::new(&self.context.network);

        if let Err(source) = plan.validate(&ValidationScope::from_context(self.context)) {
            tracing::error!(plan = %plan.name, error = %source, "Plan rejected");
            return Err(RunFailure {
                step: 0,
                label: format!("validate `{}`", plan.name),
                source,
                report,
            });
        }

        let steps = plan.active_steps(self.context.testnet);
        tracing::info!(
            plan = %plan.name,
            network = %self.context.network,
            steps = steps.len(),
            "Running deployment plan"
        );

        for (index, step) in steps.into_iter().enumerate() {
            let label = step.label();
            tracing::info!(step = index + 1, %label, "Starting step");

            let outcome = match step {
                Step::Deploy(spec) => self
                    .deploy_contract(spec, &report)
                    .await
                    .map(StepOutcome::Deployed),
                Step::Configure(call) => self
                    .apply_configuration_step(call, &report)
                    .await
                    .map(StepOutcome::Configured),
            };

            match outcome {
                Ok(StepOutcome::Deployed(record)) => report.push(record),
                Ok(StepOutcome::Configured(ConfigurationOutcome::Queued(queued))) => {
                    report.push_queued(queued)
                }
                Ok(StepOutcome::Configured(ConfigurationOutcome::Executed { .. })) => {}
                Err(source) => {
                    tracing::error!(
                        step = index + 1,
                        %label,
                        error = %source,
                        completed = report.len(),
                        "Step failed, halting run"
                    );
                    return Err(RunFailure {
                        step: index + 1,
                        label,
                        source,
                        report,
                    });
                }
            }
        }

        tracing::info!(plan = %plan.name, contracts = report.len(), "Deployment plan complete");
        Ok(report)
    }

    /// Whether the timelock still holds `entry`, read with `queuedTransactions`.
    async fn is_queued(&self, entry: &QueuedCall) -> Result<bool, OrchestratorError> {
        let tx = TransactionRequest::call(
            self.context.sender(None).map_err(OrchestratorError::configuration)?,
            entry.timelock_address,
            timelock::encode_is_queued(entry.hash),
        );
        let data = self
            .client
            .call(tx)
            .await
            .map_err(|err| call_error(&entry.label, err))?;
        timelock::decode_is_queued(&data)
            .with_context(|| format!("{}: unexpected `queuedTransactions` answer", entry.label))
            .map_err(|e| OrchestratorError::configuration(format!("{e:#}")))
    }

    /// Execute the queued timelock calls that are ready at `now`.
    ///
    /// Calls are sent by the network's default sender, which must be the
    /// timelock admin. Calls the timelock no longer holds are skipped, so a
    /// manifest can be replayed. Stops at the first failure.
    pub async fn execute_queued(
        &self,
        queued: &[QueuedCall],
        now: u64,
    ) -> Result<QueueExecution, OrchestratorError> {
        let from = self
            .context
            .sender(None)
            .map_err(OrchestratorError::configuration)?;
        let mut execution = QueueExecution::default();

        for entry in queued {
            if entry.call.is_stale(now) {
                tracing::warn!(label = %entry.label, eta = entry.call.eta, "Queued call expired");
                execution.expired.push(entry.clone());
                continue;
            }
            if !entry.call.is_ready(now) {
                tracing::info!(
                    label = %entry.label,
                    eta = entry.call.eta,
                    wait_secs = entry.call.eta - now,
                    "Queued call not ready yet"
                );
                execution.pending.push(entry.clone());
                continue;
            }
            if !self.is_queued(entry).await? {
                tracing::warn!(
                    label = %entry.label,
                    hash = %entry.hash,
                    "Call is not queued on the timelock"
                );
                execution.not_queued.push(entry.clone());
                continue;
            }

            tracing::info!(
                label = %entry.label,
                timelock = %entry.timelock,
                "Executing queued call"
            );
            let tx = TransactionRequest::call(
                from,
                entry.timelock_address,
                entry.call.encode_execute(),
            );
            let receipt = self
                .submit(tx)
                .await
                .map_err(|err| call_error(&entry.label, err))?;
            execution.executed.push((entry.clone(), receipt.transaction_hash));
        }

        Ok(execution)
    }

    /// Cancel queued timelock calls the timelock still holds, returning the
    /// cancelled calls with the hash of each cancelling transaction.
    pub async fn cancel_queued(
        &self,
        queued: &[QueuedCall],
    ) -> Result<Vec<(QueuedCall, B256)>, OrchestratorError> {
        let from = self
            .context
            .sender(None)
            .map_err(OrchestratorError::configuration)?;
        let mut cancelled = Vec::new();

        for entry in queued {
            if !self.is_queued(entry).await? {
                tracing::info!(label = %entry.label, hash = %entry.hash, "Nothing to cancel");
                continue;
            }

            tracing::info!(
                label = %entry.label,
                timelock = %entry.timelock,
                "Cancelling queued call"
            );
            let tx =
                TransactionRequest::call(from, entry.timelock_address, entry.call.encode_cancel());
            let receipt = self
                .submit(tx)
                .await
                .map_err(|err| call_error(&entry.label, err))?;
            cancelled.push((entry.clone(), receipt.transaction_hash));
        }

        Ok(cancelled)
    }
}
