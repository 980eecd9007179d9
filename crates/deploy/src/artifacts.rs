//! Compiled contract artifacts and ABI encoding.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use alloy_core::{
    dyn_abi::{DynSolValue, JsonAbiExt, Specifier},
    json_abi::{JsonAbi, Param},
    primitives::Bytes,
};
use anyhow::{Context, bail};
use serde::Deserialize;

use crate::{DeploymentPlan, OrchestratorError, Step, args::ResolvedArg};

#[derive(Deserialize)]
#[serde(untagged)]
enum RawBytecode {
    Hex(String),
    Object { object: String },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawArtifact {
    #[serde(default)]
    contract_name: Option<String>,
    abi: JsonAbi,
    #[serde(default)]
    bytecode: Option<RawBytecode>,
}

/// An ABI and creation bytecode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractArtifact {
    pub contract_name: Option<String>,
    pub abi: JsonAbi,
    /// Empty for interfaces and abstract contracts.
    pub bytecode: Bytes,
}

/// A function call ready to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedCall {
    /// Canonical signature, e.g. `transfer(address,uint256)`.
    pub signature: String,
    /// Selector followed by the encoded arguments.
    pub data: Bytes,
    /// Encoded arguments alone.
    pub params_data: Bytes,
}

fn coerce_params(params: &[Param], args: &[ResolvedArg]) -> anyhow::Result<Vec<DynSolValue>> {
    params
        .iter()
        .zip(args)
        .enumerate()
        .map(|(i, (param, arg))| {
            let ty = param
                .resolve()
                .with_context(|| format!("unsupported ABI type `{}`", param.ty))?;
            arg.coerce(&ty).with_context(|| {
                let name = if param.name.is_empty() {
                    format!("#{i}")
                } else {
                    format!("`{}`", param.name)
                };
                format!("argument {name}")
            })
        })
        .collect()
}

impl ContractArtifact {
    /// Parse a truffle or foundry artifact.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let raw: RawArtifact = serde_json::from_str(json).context("Failed to parse artifact JSON")?;

        let hex_code = match raw.bytecode {
            None => String::new(),
            Some(RawBytecode::Hex(code)) | Some(RawBytecode::Object { object: code }) => code,
        };
        if hex_code.contains("__") {
            bail!("bytecode contains unlinked library placeholders");
        }
        let bytecode = hex::decode(hex_code.strip_prefix("0x").unwrap_or(&hex_code))
            .context("invalid bytecode hex")?;

        Ok(Self {
            contract_name: raw.contract_name,
            abi: raw.abi,
            bytecode: bytecode.into(),
        })
    }

    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read artifact {}", path.display()))?;
        Self::from_json(&content).with_context(|| format!("Invalid artifact {}", path.display()))
    }

    /// Number of constructor inputs.
    pub fn constructor_arity(&self) -> usize {
        self.abi
            .constructor
            .as_ref()
            .map_or(0, |constructor| constructor.inputs.len())
    }

    /// Creation bytecode followed by the encoded constructor arguments.
    pub fn encode_deployment(&self, args: &[ResolvedArg]) -> anyhow::Result<Bytes> {
        if self.bytecode.is_empty() {
            bail!("artifact has no bytecode (interface or abstract contract)");
        }
        if args.len() != self.constructor_arity() {
            bail!(
                "constructor takes {} arguments, got {}",
                self.constructor_arity(),
                args.len()
            );
        }

        let mut data = self.bytecode.to_vec();
        if let Some(constructor) = &self.abi.constructor {
            let values = coerce_params(&constructor.inputs, args)?;
            data.extend(
                constructor
                    .abi_encode_input(&values)
                    .context("failed to encode constructor arguments")?,
            );
        }
        Ok(data.into())
    }

    /// Whether some overload of `method` takes `arity` arguments.
    pub fn has_method(&self, method: &str, arity: usize) -> bool {
        self.abi
            .function(method)
            .is_some_and(|overloads| overloads.iter().any(|f| f.inputs.len() == arity))
    }

    /// Encode a call, picking the overload of `method` by argument count.
    pub fn encode_call(&self, method: &str, args: &[ResolvedArg]) -> anyhow::Result<EncodedCall> {
        let overloads = self
            .abi
            .function(method)
            .with_context(|| format!("no function `{method}` in ABI"))?;
        let mut candidates = overloads.iter().filter(|f| f.inputs.len() == args.len());
        let function = candidates
            .next()
            .with_context(|| format!("no overload of `{method}` takes {} arguments", args.len()))?;
        if candidates.next().is_some() {
            bail!(
                "ambiguous call: several overloads of `{method}` take {} arguments",
                args.len()
            );
        }

        let values = coerce_params(&function.inputs, args)?;
        let params_data = function
            .abi_encode_input_raw(&values)
            .with_context(|| format!("failed to encode arguments of `{method}`"))?;
        let mut data = function.selector().to_vec();
        data.extend_from_slice(&params_data);

        Ok(EncodedCall {
            signature: function.signature(),
            data: data.into(),
            params_data: params_data.into(),
        })
    }
}

/// Artifacts by contract name, loaded from `<dir>/<Name>.json` on first use.
#[derive(Debug, Default)]
pub struct ArtifactStore {
    dir: Option<PathBuf>,
    cache: Mutex<BTreeMap<String, Arc<ContractArtifact>>>,
}

impl ArtifactStore {
    pub fn from_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            cache: Mutex::default(),
        }
    }

    /// A store holding only the given artifacts.
    pub fn from_artifacts(artifacts: impl IntoIterator<Item = (String, ContractArtifact)>) -> Self {
        let cache = artifacts
            .into_iter()
            .map(|(name, artifact)| (name, Arc::new(artifact)))
            .collect();
        Self {
            dir: None,
            cache: Mutex::new(cache),
        }
    }

    pub fn get(&self, name: &str) -> anyhow::Result<Arc<ContractArtifact>> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| anyhow::anyhow!("artifact cache poisoned"))?;
        if let Some(artifact) = cache.get(name) {
            return Ok(artifact.clone());
        }

        let dir = self
            .dir
            .as_ref()
            .with_context(|| format!("no artifact named `{name}`"))?;
        let path = dir.join(format!("{name}.json"));
        if !path.exists() {
            bail!("no artifact named `{name}` in {}", dir.display());
        }
        let artifact = Arc::new(ContractArtifact::load_from_file(&path)?);
        tracing::trace!(artifact = %name, path = %path.display(), "Artifact loaded");
        cache.insert(name.to_string(), artifact.clone());
        Ok(artifact)
    }

    /// Check offline that every artifact of the plan exists and every
    /// configuration step names a method of the right arity.
    pub fn check_plan(&self, plan: &DeploymentPlan) -> Result<(), OrchestratorError> {
        let mut artifact_of: BTreeMap<&str, &str> = BTreeMap::new();

        for (index, step) in plan.steps.iter().enumerate() {
            let fail = |message: String| {
                OrchestratorError::configuration(format!(
                    "step {} ({}): {message}",
                    index + 1,
                    step.label()
                ))
            };

            match step {
                Step::Deploy(spec) => {
                    let artifact = self
                        .get(spec.artifact_name())
                        .map_err(|e| fail(format!("{e:#}")))?;
                    if artifact.bytecode.is_empty() {
                        return Err(fail(format!(
                            "artifact `{}` has no bytecode",
                            spec.artifact_name()
                        )));
                    }
                    if artifact.constructor_arity() != spec.args.len() {
                        return Err(fail(format!(
                            "constructor of `{}` takes {} arguments, got {}",
                            spec.artifact_name(),
                            artifact.constructor_arity(),
                            spec.args.len()
                        )));
                    }
                    artifact_of.insert(spec.id.as_str(), spec.artifact_name());
                }
                Step::Configure(call) => {
                    let Some(name) = artifact_of.get(call.target()) else {
                        return Err(fail(format!(
                            "`{}` is not deployed by this plan",
                            call.target()
                        )));
                    };
                    let artifact = self.get(name).map_err(|e| fail(format!("{e:#}")))?;
                    if !artifact.has_method(call.method(), call.args.len()) {
                        return Err(fail(format!(
                            "`{name}` has no method `{}` taking {} arguments",
                            call.method(),
                            call.args.len()
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ConfigurationStep, ContractSpec};
    use alloy_core::primitives::{Address, U256, hex};

    const TOKEN_ABI: &str = r#"[
        {"type":"constructor","inputs":[{"name":"initialSupply","type":"uint256"}],"stateMutability":"nonpayable"},
        {"type":"function","name":"transfer","inputs":[{"name":"to","type":"address"},{"name":"amount","type":"uint256"}],"outputs":[{"name":"","type":"bool"}],"stateMutability":"nonpayable"},
        {"type":"function","name":"approve","inputs":[{"name":"spender","type":"address"},{"name":"amount","type":"uint256"}],"outputs":[{"name":"","type":"bool"}],"stateMutability":"nonpayable"},
        {"type":"function","name":"mint","inputs":[{"name":"amount","type":"uint256"}],"outputs":[],"stateMutability":"nonpayable"},
        {"type":"function","name":"mint","inputs":[{"name":"to","type":"address"},{"name":"amount","type":"uint256"}],"outputs":[],"stateMutability":"nonpayable"}
    ]"#;

    fn token() -> ContractArtifact {
        ContractArtifact::from_json(&format!(
            r#"{{"contractName":"BullToken","abi":{TOKEN_ABI},"bytecode":"0x6080"}}"#
        ))
        .unwrap()
    }

    #[test]
    fn test_parse_truffle_and_foundry() {
        let truffle = token();
        assert_eq!(truffle.contract_name.as_deref(), Some("BullToken"));
        assert_eq!(truffle.bytecode, Bytes::from(vec![0x60, 0x80]));
        assert_eq!(truffle.constructor_arity(), 1);

        let foundry = ContractArtifact::from_json(&format!(
            r#"{{"abi":{TOKEN_ABI},"bytecode":{{"object":"0x6080","linkReferences":{{}}}}}}"#
        ))
        .unwrap();
        assert_eq!(foundry.bytecode, truffle.bytecode);
        assert!(foundry.contract_name.is_none());
    }

    #[test]
    fn test_reject_unlinked_bytecode() {
        let err = ContractArtifact::from_json(
            r#"{"abi":[],"bytecode":"0x6080__$a1b2c3$__6080"}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unlinked"));
    }

    #[test]
    fn test_encode_deployment() {
        let data = token()
            .encode_deployment(&[ResolvedArg::Scalar("1000".into())])
            .unwrap();
        assert_eq!(data.len(), 2 + 32);
        assert_eq!(&data[..2], &[0x60, 0x80]);
        assert_eq!(U256::from_be_slice(&data[2..]), U256::from(1000));

        assert!(token().encode_deployment(&[]).is_err());

        let interface = ContractArtifact::from_json(r#"{"abi":[]}"#).unwrap();
        assert!(interface.encode_deployment(&[]).is_err());
    }

    #[test]
    fn test_encode_call_selects_overload() {
        let to = Address::repeat_byte(0x22);
        let call = token()
            .encode_call("transfer", &[ResolvedArg::Address(to), ResolvedArg::Uint(U256::from(5))])
            .unwrap();
        assert_eq!(call.signature, "transfer(address,uint256)");
        assert_eq!(&call.data[..4], hex!("a9059cbb"));
        assert_eq!(&call.data[4..], &call.params_data[..]);

        let mint = token()
            .encode_call("mint", &[ResolvedArg::Scalar("7".into())])
            .unwrap();
        assert_eq!(mint.signature, "mint(uint256)");
        let mint = token()
            .encode_call("mint", &[ResolvedArg::Address(to), ResolvedArg::Scalar("7".into())])
            .unwrap();
        assert_eq!(mint.signature, "mint(address,uint256)");

        assert!(token().encode_call("burn", &[]).is_err());
        assert!(token().encode_call("approve", &[ResolvedArg::Address(to)]).is_err());
    }

    #[test]
    fn test_store_loads_from_dir() {
        let temp_dir = tempdir::TempDir::new("bullrun-test").expect("Failed to create temp dir");
        std::fs::write(
            temp_dir.path().join("BullToken.json"),
            format!(r#"{{"contractName":"BullToken","abi":{TOKEN_ABI},"bytecode":"0x6080"}}"#),
        )
        .unwrap();

        let store = ArtifactStore::from_dir(temp_dir.path());
        assert_eq!(store.get("BullToken").unwrap().constructor_arity(), 1);
        assert!(store.get("Masterchef").is_err());
    }

    #[test]
    fn test_check_plan() {
        let store = ArtifactStore::from_artifacts([("BullToken".to_string(), token())]);

        let plan = DeploymentPlan::new("main contracts")
            .step(ContractSpec::new("BullToken").args(vec!["1000".parse().unwrap()]))
            .step(ConfigurationStep::new(
                "BullToken",
                "transfer",
                vec!["$tester".parse().unwrap(), "1 ether".parse().unwrap()],
            ));
        store.check_plan(&plan).unwrap();

        let plan = DeploymentPlan::new("main contracts")
            .step(ContractSpec::new("BullToken").args(vec!["1000".parse().unwrap()]))
            .step(ConfigurationStep::new("BullToken", "transfer", vec![]));
        let err = store.check_plan(&plan).unwrap_err();
        assert!(err.to_string().contains("no method `transfer` taking 0 arguments"), "{err}");

        let plan = DeploymentPlan::new("main contracts").step(ContractSpec::new("Masterchef"));
        assert!(store.check_plan(&plan).unwrap_err().is_configuration());
    }
}
