use crate::{
    ControllerId, QueryConfig, QueryError, QuerySpec, QuerySpecBuilder, RegisterAddress,
    Resolution,
};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_TIMEOUT_MS: u64 = 100;

/// A named "what to read, from whom" decision, usually loaded from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryProfile {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_controller")]
    pub controller: u8,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Start from the default register set.
    #[serde(default = "default_true")]
    pub defaults: bool,
    #[serde(default)]
    pub transport: TransportSettings,
    #[serde(default)]
    pub registers: Vec<RegisterEntry>,
}

fn default_controller() -> u8 {
    1
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportSettings {
    #[serde(default)]
    pub max_payload: Option<usize>,
    #[serde(default)]
    pub fd: Option<bool>,
    #[serde(default)]
    pub source_id: Option<u8>,
    #[serde(default)]
    pub prefix: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterEntry {
    pub address: AddressRepr,
    #[serde(rename = "type")]
    pub kind: ResolutionKind,
    #[serde(default)]
    pub scale: Option<f64>,
}

/// Register address as a YAML integer or a `"0x…"`/decimal string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AddressRepr {
    Number(u32),
    Text(String),
}

impl AddressRepr {
    pub fn parse(&self) -> Option<RegisterAddress> {
        match self {
            AddressRepr::Number(n) => Some(RegisterAddress(*n)),
            AddressRepr::Text(s) => parse_address(s),
        }
    }
}

/// Parse `0x1f`, `0X1F` or `31`.
pub fn parse_address(s: &str) -> Option<RegisterAddress> {
    let t = s.trim();
    let val = match t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok()?,
        None => t.parse::<u32>().ok()?,
    };
    Some(RegisterAddress(val))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionKind {
    Int8,
    Int16,
    Int32,
    Uint8,
    Uint16,
    Uint32,
    Float32,
    Fixed8,
    Fixed16,
    Fixed32,
}

impl ResolutionKind {
    /// Combine with a scale; fixed kinds need one, the others must not have one.
    pub fn resolve(self, scale: Option<f64>) -> Option<Resolution> {
        let plain = match self {
            ResolutionKind::Int8 => Resolution::Int8,
            ResolutionKind::Int16 => Resolution::Int16,
            ResolutionKind::Int32 => Resolution::Int32,
            ResolutionKind::Uint8 => Resolution::UInt8,
            ResolutionKind::Uint16 => Resolution::UInt16,
            ResolutionKind::Uint32 => Resolution::UInt32,
            ResolutionKind::Float32 => Resolution::Float32,
            ResolutionKind::Fixed8 => return Resolution::fixed(8, scale?),
            ResolutionKind::Fixed16 => return Resolution::fixed(16, scale?),
            ResolutionKind::Fixed32 => return Resolution::fixed(32, scale?),
        };
        scale.is_none().then_some(plain)
    }
}

impl FromStr for ResolutionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s.trim().to_ascii_lowercase().as_str() {
            "int8" | "i8" => ResolutionKind::Int8,
            "int16" | "i16" => ResolutionKind::Int16,
            "int32" | "i32" => ResolutionKind::Int32,
            "uint8" | "u8" => ResolutionKind::Uint8,
            "uint16" | "u16" => ResolutionKind::Uint16,
            "uint32" | "u32" => ResolutionKind::Uint32,
            "float32" | "f32" => ResolutionKind::Float32,
            "fixed8" => ResolutionKind::Fixed8,
            "fixed16" => ResolutionKind::Fixed16,
            "fixed32" => ResolutionKind::Fixed32,
            other => return Err(format!("unknown register type: {other}")),
        };
        Ok(kind)
    }
}

impl RegisterEntry {
    pub fn resolve(&self) -> crate::Result<(RegisterAddress, Resolution)> {
        let addr = self.address.parse().ok_or_else(|| {
            QueryError::InvalidConfig(format!("invalid register address: {:?}", self.address))
        })?;
        let res = self
            .kind
            .resolve(self.scale)
            .ok_or(QueryError::InvalidResolution(addr))?;
        Ok((addr, res))
    }
}

impl QueryProfile {
    pub fn controller_id(&self) -> crate::Result<ControllerId> {
        ControllerId::new(self.controller).ok_or_else(|| {
            QueryError::InvalidConfig(format!("controller id {} exceeds 7 bits", self.controller))
        })
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS))
    }

    /// The registers to read: defaults (if enabled) with the profile's entries on top.
    pub fn query_spec(&self) -> crate::Result<QuerySpec> {
        let mut builder = if self.defaults {
            QuerySpecBuilder::with_defaults()
        } else {
            QuerySpecBuilder::new()
        };
        for entry in &self.registers {
            let (addr, res) = entry.resolve()?;
            builder = builder.with(addr, res);
        }
        builder.build()
    }

    pub fn query_config(&self) -> QueryConfig {
        let base = QueryConfig::default();
        QueryConfig {
            source_id: self.transport.source_id.unwrap_or(base.source_id),
            prefix: self.transport.prefix.unwrap_or(base.prefix),
            max_payload: self.transport.max_payload.or(base.max_payload),
            fd: self.transport.fd.unwrap_or(base.fd),
            drain_limit: base.drain_limit,
        }
    }
}

/// Profiles keyed by name (or file stem when unnamed).
#[derive(Debug, Default, Clone)]
pub struct ProfileSet {
    pub profiles: BTreeMap<String, QueryProfile>,
}

impl ProfileSet {
    pub fn insert(&mut self, key: String, profile: QueryProfile) {
        self.profiles.insert(key, profile);
    }
}

pub fn load_profile_file(path: impl AsRef<Path>) -> anyhow::Result<QueryProfile> {
    let path = path.as_ref();
    let raw =
        fs::read_to_string(path).with_context(|| format!("reading profile: {}", path.display()))?;
    parse_profile(&raw).with_context(|| format!("decoding profile: {}", path.display()))
}

/// Parse and validate a profile from YAML text.
pub fn parse_profile(raw: &str) -> anyhow::Result<QueryProfile> {
    let profile: QueryProfile = serde_yaml::from_str(raw).context("parsing yaml")?;
    profile.controller_id()?;
    profile.query_spec()?;
    Ok(profile)
}

pub fn load_profiles_dir(dir: impl AsRef<Path>) -> anyhow::Result<ProfileSet> {
    let mut set = ProfileSet::default();
    let mut entries: Vec<PathBuf> = Vec::new();
    for entry in fs::read_dir(dir.as_ref())? {
        let path = entry?.path();
        if let Some(ext) = path.extension() {
            if ext == "yml" || ext == "yaml" {
                entries.push(path);
            }
        }
    }
    entries.sort();
    for p in entries {
        let profile = load_profile_file(&p)?;
        let key = profile.name.clone().unwrap_or_else(|| {
            p.file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default()
        });
        set.insert(key, profile);
    }
    Ok(set)
}
