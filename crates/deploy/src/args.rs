//! Argument expressions for constructor arguments, configuration calls and
//! network parameters.
//!
//! In plan and network files an expression is a TOML string, integer, boolean
//! or array:
//!
//! - `"@Name"`: address of the contract deployed as `Name` earlier in the run
//! - `"$role"`: address of a named account role
//! - `"%param"`: a network parameter, itself an expression
//! - `"20 ether"`: an amount scaled by 10^18
//! - `"max"`: the maximum `uint256`
//! - `"block"`, `"block+10000"`: the current block number, plus an offset
//! - anything else is a literal coerced to the ABI parameter type

use std::{collections::BTreeMap, fmt, str::FromStr};

use alloy_core::{
    dyn_abi::{DynSolType, DynSolValue},
    primitives::{Address, U256, utils::parse_ether},
};
use anyhow::{Context, bail};
use derive_more::{Display, Error};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de::Error as _, ser::SerializeSeq};

use crate::DeploymentReport;

/// Maximum depth of `%param` indirections before resolution gives up.
pub const MAX_PARAM_DEPTH: usize = 8;

/// An unresolved argument expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgExpr {
    Contract(String),
    Role(String),
    Param(String),
    /// Decimal ether amount, validated at parse time.
    Ether(String),
    MaxUint,
    BlockNumber { offset: u64 },
    Literal(String),
    List(Vec<ArgExpr>),
}

fn non_empty(name: &str, sigil: char) -> anyhow::Result<String> {
    if name.is_empty() {
        bail!("`{sigil}` must be followed by a name");
    }
    Ok(name.to_string())
}

impl FromStr for ArgExpr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();

        if let Some(name) = s.strip_prefix('@') {
            return Ok(Self::Contract(non_empty(name, '@')?));
        }
        if let Some(name) = s.strip_prefix('$') {
            return Ok(Self::Role(non_empty(name, '$')?));
        }
        if let Some(name) = s.strip_prefix('%') {
            return Ok(Self::Param(non_empty(name, '%')?));
        }
        if let Some(amount) = s.strip_suffix(" ether") {
            let amount = amount.trim();
            parse_ether(amount).with_context(|| format!("invalid ether amount `{amount}`"))?;
            return Ok(Self::Ether(amount.to_string()));
        }
        if s == "max" {
            return Ok(Self::MaxUint);
        }
        if s == "block" {
            return Ok(Self::BlockNumber { offset: 0 });
        }
        if let Some(offset) = s.strip_prefix("block+") {
            let offset = offset
                .trim()
                .parse()
                .with_context(|| format!("invalid block offset in `{s}`"))?;
            return Ok(Self::BlockNumber { offset });
        }

        Ok(Self::Literal(s.to_string()))
    }
}

impl fmt::Display for ArgExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Contract(name) => write!(f, "@{name}"),
            Self::Role(name) => write!(f, "${name}"),
            Self::Param(name) => write!(f, "%{name}"),
            Self::Ether(amount) => write!(f, "{amount} ether"),
            Self::MaxUint => f.write_str("max"),
            Self::BlockNumber { offset: 0 } => f.write_str("block"),
            Self::BlockNumber { offset } => write!(f, "block+{offset}"),
            Self::Literal(value) => f.write_str(value),
            Self::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl Serialize for ArgExpr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            other => serializer.serialize_str(&other.to_string()),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawArg {
    Bool(bool),
    Int(i64),
    Str(String),
    List(Vec<ArgExpr>),
}

impl<'de> Deserialize<'de> for ArgExpr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match RawArg::deserialize(deserializer)? {
            RawArg::Bool(value) => Ok(Self::Literal(value.to_string())),
            RawArg::Int(value) => Ok(Self::Literal(value.to_string())),
            RawArg::Str(value) => value.parse().map_err(|e| D::Error::custom(format!("{e:#}"))),
            RawArg::List(items) => Ok(Self::List(items)),
        }
    }
}

impl ArgExpr {
    /// Contract identifiers referenced directly by this expression.
    pub fn contract_refs(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.visit(&mut |expr| {
            if let Self::Contract(name) = expr {
                out.push(name.as_str());
            }
        });
        out
    }

    /// Parameter names referenced directly by this expression.
    pub fn param_refs(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.visit(&mut |expr| {
            if let Self::Param(name) = expr {
                out.push(name.as_str());
            }
        });
        out
    }

    /// Role names referenced directly by this expression.
    pub fn role_refs(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.visit(&mut |expr| {
            if let Self::Role(name) = expr {
                out.push(name.as_str());
            }
        });
        out
    }

    /// Whether resolving this expression requires the current block number.
    pub fn needs_block_number(&self) -> bool {
        let mut needed = false;
        self.visit(&mut |expr| needed |= matches!(expr, Self::BlockNumber { .. }));
        needed
    }

    /// Replace every `block` expression with the literal block number.
    pub fn with_block_number(self, block_number: u64) -> Self {
        match self {
            Self::BlockNumber { offset } => {
                Self::Literal(block_number.saturating_add(offset).to_string())
            }
            Self::List(items) => Self::List(
                items
                    .into_iter()
                    .map(|item| item.with_block_number(block_number))
                    .collect(),
            ),
            other => other,
        }
    }

    fn visit<'a>(&'a self, f: &mut impl FnMut(&'a Self)) {
        f(self);
        if let Self::List(items) = self {
            for item in items {
                item.visit(f);
            }
        }
    }
}

/// Why an expression could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum ResolveError {
    #[display("contract `{name}` is not deployed yet")]
    UnknownContract { name: String },
    #[display("unknown account role `{name}`")]
    UnknownRole { name: String },
    #[display("unknown parameter `{name}`")]
    UnknownParam { name: String },
    #[display("parameter `{name}` nests deeper than {MAX_PARAM_DEPTH} levels")]
    ParamTooDeep { name: String },
    #[display("`{expr}` needs the current block number")]
    BlockNumberUnavailable { expr: String },
}

/// A resolved argument, ready to be coerced to its ABI type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedArg {
    Address(Address),
    Uint(U256),
    Scalar(String),
    List(Vec<ResolvedArg>),
}

impl fmt::Display for ResolvedArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Address(address) => write!(f, "{}", address.to_checksum(None)),
            Self::Uint(value) => write!(f, "{value}"),
            Self::Scalar(value) => f.write_str(value),
            Self::List(items) => {
                let items: Vec<String> = items.iter().map(ToString::to_string).collect();
                write!(f, "[{}]", items.join(", "))
            }
        }
    }
}

impl ResolvedArg {
    /// Coerce into a value of the given ABI type.
    pub fn coerce(&self, ty: &DynSolType) -> anyhow::Result<DynSolValue> {
        match (ty, self) {
            (DynSolType::Address, Self::Address(address)) => Ok(DynSolValue::Address(*address)),
            (DynSolType::Uint(bits), Self::Uint(value)) => {
                if value.bit_len() > *bits {
                    bail!("`{value}` does not fit in {}", ty.sol_type_name());
                }
                Ok(DynSolValue::Uint(*value, *bits))
            }
            (DynSolType::Array(inner), Self::List(items)) => Ok(DynSolValue::Array(
                items
                    .iter()
                    .map(|item| item.coerce(inner))
                    .collect::<anyhow::Result<_>>()?,
            )),
            (DynSolType::FixedArray(inner, len), Self::List(items)) => {
                if items.len() != *len {
                    bail!(
                        "expected {} elements for {}, got {}",
                        len,
                        ty.sol_type_name(),
                        items.len()
                    );
                }
                Ok(DynSolValue::FixedArray(
                    items
                        .iter()
                        .map(|item| item.coerce(inner))
                        .collect::<anyhow::Result<_>>()?,
                ))
            }
            (_, Self::Scalar(value)) => ty
                .coerce_str(value)
                .with_context(|| format!("cannot coerce `{value}` to {}", ty.sol_type_name())),
            (_, other) => bail!("cannot use `{other}` as {}", ty.sol_type_name()),
        }
    }
}

/// Everything an expression may refer to while a plan runs.
pub struct Scope<'a> {
    pub records: &'a DeploymentReport,
    pub roles: &'a BTreeMap<String, Address>,
    pub params: &'a BTreeMap<String, ArgExpr>,
    pub block_number: Option<u64>,
}

impl Scope<'_> {
    pub fn resolve(&self, expr: &ArgExpr) -> Result<ResolvedArg, ResolveError> {
        self.resolve_at(expr, 0)
    }

    pub fn resolve_all(&self, exprs: &[ArgExpr]) -> Result<Vec<ResolvedArg>, ResolveError> {
        exprs.iter().map(|expr| self.resolve(expr)).collect()
    }

    fn resolve_at(&self, expr: &ArgExpr, depth: usize) -> Result<ResolvedArg, ResolveError> {
        match expr {
            ArgExpr::Contract(name) => self
                .records
                .address(name)
                .map(ResolvedArg::Address)
                .ok_or_else(|| ResolveError::UnknownContract { name: name.clone() }),
            ArgExpr::Role(name) => self
                .roles
                .get(name)
                .copied()
                .map(ResolvedArg::Address)
                .ok_or_else(|| ResolveError::UnknownRole { name: name.clone() }),
            ArgExpr::Param(name) => {
                if depth >= MAX_PARAM_DEPTH {
                    return Err(ResolveError::ParamTooDeep { name: name.clone() });
                }
                let value = self
                    .params
                    .get(name)
                    .ok_or_else(|| ResolveError::UnknownParam { name: name.clone() })?;
                self.resolve_at(value, depth + 1)
            }
            // Validated when parsed.
            ArgExpr::Ether(amount) => Ok(parse_ether(amount)
                .map(ResolvedArg::Uint)
                .unwrap_or_else(|_| ResolvedArg::Scalar(amount.clone()))),
            ArgExpr::MaxUint => Ok(ResolvedArg::Uint(U256::MAX)),
            ArgExpr::BlockNumber { offset } => self
                .block_number
                .map(|number| ResolvedArg::Uint(U256::from(number.saturating_add(*offset))))
                .ok_or_else(|| ResolveError::BlockNumberUnavailable {
                    expr: expr.to_string(),
                }),
            ArgExpr::Literal(value) => Ok(ResolvedArg::Scalar(value.clone())),
            ArgExpr::List(items) => Ok(ResolvedArg::List(
                items
                    .iter()
                    .map(|item| self.resolve_at(item, depth))
                    .collect::<Result<_, _>>()?,
            )),
        }
    }
}
