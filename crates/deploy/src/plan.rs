//! Deployment plans: the ordered list of contract deployments and configuration
//! calls for one environment.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    path::Path,
    str::FromStr,
};

use anyhow::Context;
use serde::{Deserialize, Deserializer, Serialize, Serializer, de::Error as _};
use sha2::{Digest, Sha256};

use crate::{ArgExpr, OrchestratorError, args::MAX_PARAM_DEPTH, timelock};

/// When a step runs.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StepCondition {
    #[default]
    Always,
    /// Only on test networks (local chains, public testnets).
    Testnet,
    /// Only on production networks.
    Mainnet,
}

impl StepCondition {
    pub fn applies(self, testnet: bool) -> bool {
        match self {
            Self::Always => true,
            Self::Testnet => testnet,
            Self::Mainnet => !testnet,
        }
    }

    fn is_always(&self) -> bool {
        *self == Self::Always
    }
}

/// A contract to deploy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContractSpec {
    /// Identifier the deployed address is recorded under.
    #[serde(rename = "deploy")]
    pub id: String,
    /// Artifact to deploy. Defaults to `id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    /// Constructor arguments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<ArgExpr>,
    /// Sender role. Defaults to the network's default sender.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "StepCondition::is_always")]
    pub when: StepCondition,
}

impl ContractSpec {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            artifact: None,
            args: Vec::new(),
            from: None,
            when: StepCondition::Always,
        }
    }

    pub fn artifact(mut self, artifact: impl Into<String>) -> Self {
        self.artifact = Some(artifact.into());
        self
    }

    pub fn args(mut self, args: Vec<ArgExpr>) -> Self {
        self.args = args;
        self
    }

    pub fn from(mut self, role: impl Into<String>) -> Self {
        self.from = Some(role.into());
        self
    }

    pub fn when(mut self, when: StepCondition) -> Self {
        self.when = when;
        self
    }

    pub fn artifact_name(&self) -> &str {
        self.artifact.as_deref().unwrap_or(&self.id)
    }
}

/// `Target.method`, the contract and function a configuration step calls.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodRef {
    pub target: String,
    pub method: String,
}

impl FromStr for MethodRef {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (target, method) = s
            .split_once('.')
            .with_context(|| format!("expected `Contract.method`, got `{s}`"))?;
        if target.is_empty() || method.is_empty() {
            anyhow::bail!("expected `Contract.method`, got `{s}`");
        }
        Ok(Self {
            target: target.to_string(),
            method: method.to_string(),
        })
    }
}

impl fmt::Display for MethodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.target, self.method)
    }
}

impl Serialize for MethodRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MethodRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(|e| D::Error::custom(format!("{e:#}")))
    }
}

/// Routes a configuration call through a timelock instead of calling the target
/// directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimelockRoute {
    /// Identifier of the deployed timelock contract.
    pub contract: String,
    /// The timelock's configured delay.
    pub delay_secs: u64,
}

/// A call against a contract deployed earlier in the plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigurationStep {
    pub call: MethodRef,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<ArgExpr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// Free-form description shown in logs instead of `Target.method`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "StepCondition::is_always")]
    pub when: StepCondition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timelock: Option<TimelockRoute>,
}

impl ConfigurationStep {
    pub fn new(target: impl Into<String>, method: impl Into<String>, args: Vec<ArgExpr>) -> Self {
        Self {
            call: MethodRef {
                target: target.into(),
                method: method.into(),
            },
            args,
            from: None,
            label: None,
            when: StepCondition::Always,
            timelock: None,
        }
    }

    pub fn from(mut self, role: impl Into<String>) -> Self {
        self.from = Some(role.into());
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn when(mut self, when: StepCondition) -> Self {
        self.when = when;
        self
    }

    pub fn via_timelock(mut self, contract: impl Into<String>, delay_secs: u64) -> Self {
        self.timelock = Some(TimelockRoute {
            contract: contract.into(),
            delay_secs,
        });
        self
    }

    pub fn target(&self) -> &str {
        &self.call.target
    }

    pub fn method(&self) -> &str {
        &self.call.method
    }
}

/// One entry of a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Step {
    Deploy(ContractSpec),
    Configure(ConfigurationStep),
}

impl Step {
    pub fn label(&self) -> String {
        match self {
            Self::Deploy(spec) => format!("deploy {}", spec.id),
            Self::Configure(step) => match &step.label {
                Some(label) => format!("{} ({label})", step.call),
                None => step.call.to_string(),
            },
        }
    }

    pub fn condition(&self) -> StepCondition {
        match self {
            Self::Deploy(spec) => spec.when,
            Self::Configure(step) => step.when,
        }
    }

    pub fn args(&self) -> &[ArgExpr] {
        match self {
            Self::Deploy(spec) => &spec.args,
            Self::Configure(step) => &step.args,
        }
    }

    pub fn sender(&self) -> Option<&str> {
        match self {
            Self::Deploy(spec) => spec.from.as_deref(),
            Self::Configure(step) => step.from.as_deref(),
        }
    }
}

impl From<ContractSpec> for Step {
    fn from(spec: ContractSpec) -> Self {
        Self::Deploy(spec)
    }
}

impl From<ConfigurationStep> for Step {
    fn from(step: ConfigurationStep) -> Self {
        Self::Configure(step)
    }
}

/// What a plan may refer to on a given network, for offline validation.
#[derive(Debug, Clone, Default)]
pub struct ValidationScope {
    pub testnet: bool,
    pub params: BTreeMap<String, ArgExpr>,
    pub roles: BTreeSet<String>,
    pub default_sender: String,
}

/// An ordered list of deployment and configuration steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentPlan {
    /// Name used for report files, e.g. `main contracts`.
    pub name: String,
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl DeploymentPlan {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// Append a step.
    pub fn step(mut self, step: impl Into<Step>) -> Self {
        self.steps.push(step.into());
        self
    }

    /// Load a plan from a TOML file.
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan from {}", path.display()))?;
        let plan: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse plan {}", path.display()))?;
        tracing::debug!(path = %path.display(), steps = plan.steps.len(), "Plan loaded");
        Ok(plan)
    }

    /// Steps that run on a network, in order.
    pub fn active_steps(&self, testnet: bool) -> Vec<&Step> {
        self.steps
            .iter()
            .filter(|step| step.condition().applies(testnet))
            .collect()
    }

    /// Identifiers deployed on a network, in order.
    pub fn contract_ids(&self, testnet: bool) -> Vec<&str> {
        self.active_steps(testnet)
            .into_iter()
            .filter_map(|step| match step {
                Step::Deploy(spec) => Some(spec.id.as_str()),
                Step::Configure(_) => None,
            })
            .collect()
    }

    /// Check that every step only refers to contracts declared before it, and to
    /// known parameters and roles.
    ///
    /// Runs without a network: this is the ordering contract of the plan.
    pub fn validate(&self, scope: &ValidationScope) -> Result<(), OrchestratorError> {
        let mut declared: BTreeSet<&str> = BTreeSet::new();

        for (index, step) in self.active_steps(scope.testnet).into_iter().enumerate() {
            let fail = |message: String| {
                OrchestratorError::configuration(format!(
                    "step {} ({}): {message}",
                    index + 1,
                    step.label()
                ))
            };

            for expr in step.args() {
                for name in referenced_contracts(expr, &scope.params).map_err(&fail)? {
                    if !declared.contains(name.as_str()) {
                        return Err(fail(format!(
                            "references `{name}` before it is deployed"
                        )));
                    }
                }
                for role in referenced_roles(expr, &scope.params) {
                    if !scope.roles.contains(&role) {
                        return Err(fail(format!("unknown account role `{role}`")));
                    }
                }
            }

            let sender = step.sender().unwrap_or(scope.default_sender.as_str());
            if !scope.roles.contains(sender) {
                return Err(fail(format!("unknown sender role `{sender}`")));
            }

            match step {
                Step::Deploy(spec) => {
                    if !declared.insert(spec.id.as_str()) {
                        return Err(fail(format!("`{}` is deployed twice", spec.id)));
                    }
                }
                Step::Configure(call) => {
                    if !declared.contains(call.target()) {
                        return Err(fail(format!(
                            "calls `{}` before it is deployed",
                            call.target()
                        )));
                    }
                    if let Some(route) = &call.timelock {
                        if !declared.contains(route.contract.as_str()) {
                            return Err(fail(format!(
                                "routes through timelock `{}` before it is deployed",
                                route.contract
                            )));
                        }
                        timelock::validate_delay(route.delay_secs)
                            .map_err(|e| fail(e.to_string()))?;
                    }
                }
            }
        }

        Ok(())
    }

    /// SHA-256 of the plan's canonical JSON, hex encoded.
    pub fn fingerprint(&self) -> anyhow::Result<String> {
        let json = serde_json::to_string(self).context("Failed to serialize plan")?;
        Ok(hex::encode(Sha256::digest(json.as_bytes())))
    }
}

/// Contract identifiers an expression depends on, following `%param` indirections.
fn referenced_contracts(
    expr: &ArgExpr,
    params: &BTreeMap<String, ArgExpr>,
) -> Result<Vec<String>, String> {
    let mut out = Vec::new();
    collect_refs(expr, params, 0, &mut out, &|e| {
        e.contract_refs().into_iter().map(String::from).collect()
    })?;
    Ok(out)
}

fn referenced_roles(expr: &ArgExpr, params: &BTreeMap<String, ArgExpr>) -> Vec<String> {
    let mut out = Vec::new();
    // Unknown params are already reported by `referenced_contracts`.
    let _ = collect_refs(expr, params, 0, &mut out, &|e| {
        e.role_refs().into_iter().map(String::from).collect()
    });
    out
}

fn collect_refs(
    expr: &ArgExpr,
    params: &BTreeMap<String, ArgExpr>,
    depth: usize,
    out: &mut Vec<String>,
    direct: &dyn Fn(&ArgExpr) -> Vec<String>,
) -> Result<(), String> {
    out.extend(direct(expr));
    for name in expr.param_refs() {
        if depth >= MAX_PARAM_DEPTH {
            return Err(format!(
                "parameter `{name}` nests deeper than {MAX_PARAM_DEPTH} levels"
            ));
        }
        let value = params
            .get(name)
            .ok_or_else(|| format!("unknown parameter `{name}`"))?;
        collect_refs(value, params, depth + 1, out, direct)?;
    }
    Ok(())
}
