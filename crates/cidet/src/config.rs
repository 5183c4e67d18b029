//! Session configuration, normally read from `CIDET_*` environment variables.

use std::path::PathBuf;

use crate::ctx::SegReg;
use crate::encoding::SegPrefixes;
use crate::error::{CidetError, Result};
use crate::mode::TargetMode;

pub const DEFAULT_SEED: u64 = 0x_6369_6465_745f_7631;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CidetConfig {
    pub mode: TargetMode,
    pub seed: u64,
    /// Segment-override prefixes the enumerator adds to memory forms.
    pub seg_prefixes: SegPrefixes,
    /// Lower-cased mnemonic substrings; empty selects everything.
    pub filter: Vec<String>,
    pub report_path: Option<PathBuf>,
    /// Also enumerate encodings with the address-size prefix.
    pub alternate_address_size: bool,
}

impl Default for CidetConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            seed: DEFAULT_SEED,
            seg_prefixes: SegPrefixes::empty(),
            filter: Vec::new(),
            report_path: None,
            alternate_address_size: true,
        }
    }
}

fn default_mode() -> TargetMode {
    if cfg!(target_arch = "x86_64") {
        TargetMode::Lm64
    } else {
        TargetMode::Pp32
    }
}

impl CidetConfig {
    /// Reads `CIDET_MODE`, `CIDET_SEED`, `CIDET_SEG_PREFIXES`, `CIDET_FILTER` and
    /// `CIDET_REPORT_PATH`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        let var = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(raw) = var("CIDET_MODE") {
            config.mode = raw
                .parse()
                .map_err(|err: String| CidetError::Config(format!("CIDET_MODE: {err}")))?;
        }
        if let Some(raw) = var("CIDET_SEED") {
            config.seed = parse_seed(&raw)
                .ok_or_else(|| CidetError::Config(format!("CIDET_SEED: invalid seed {raw:?}")))?;
        }
        if let Some(raw) = var("CIDET_SEG_PREFIXES") {
            config.seg_prefixes = parse_seg_prefixes(&raw)?;
        }
        if let Some(raw) = var("CIDET_FILTER") {
            config.filter = parse_filter_terms(&raw);
        }
        config.report_path = lookup("CIDET_REPORT_PATH")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);
        Ok(config)
    }

    /// Whether an instruction named `name` passes the filter.
    pub fn selects(&self, name: &str) -> bool {
        if self.filter.is_empty() {
            return true;
        }
        let name = name.to_ascii_lowercase();
        self.filter.iter().any(|term| name.contains(term.as_str()))
    }
}

fn parse_seed(input: &str) -> Option<u64> {
    // Allow `_` separators and `0x...` notation.
    let cleaned: String = input.chars().filter(|c| *c != '_').collect();
    let cleaned = cleaned.as_str();
    let (radix, digits) = match cleaned.strip_prefix("0x").or_else(|| cleaned.strip_prefix("0X")) {
        Some(rest) => (16, rest),
        None => (10, cleaned),
    };
    if digits.is_empty() {
        return None;
    }
    u64::from_str_radix(digits, radix).ok()
}

fn parse_seg_prefixes(input: &str) -> Result<SegPrefixes> {
    let mut prefixes = SegPrefixes::empty();
    for term in input.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        match term.to_ascii_lowercase().as_str() {
            "all" => prefixes = SegPrefixes::all(),
            "none" => prefixes = SegPrefixes::empty(),
            name => {
                let seg = SegReg::ALL
                    .into_iter()
                    .find(|seg| seg.name() == name)
                    .ok_or_else(|| {
                        CidetError::Config(format!("CIDET_SEG_PREFIXES: unknown segment {name:?}"))
                    })?;
                prefixes |= SegPrefixes::for_seg(seg);
            }
        }
    }
    Ok(prefixes)
}

fn parse_filter_terms(filter: &str) -> Vec<String> {
    filter
        .split(|c: char| c == ',' || c == ';' || c.is_whitespace())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_ascii_lowercase())
        .collect()
}
