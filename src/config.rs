//! # Configuration Module
//!
//! Everything an injection needs to know that can not be found out at runtime: which process,
//! which function from which library, how long that function is, and where the breakpoint and
//! the function pointer slot are inside the traced binary. The offsets usually come from static
//! analysis of the binary, for example with `objdump -d` and `readelf -r`.
//!
//! Configurations are JSON files. Offsets can be written as numbers or as `"0x..."` strings:
//!
//! ```json
//! {
//!     "pid": 26381,
//!     "library": "/home/user/lib4.so",
//!     "symbol": "foo",
//!     "code_len": 23,
//!     "module_name": "noF_debug",
//!     "breakpoint_offset": "0x11c5",
//!     "slot_offset": "0x3fc8",
//!     "slot_target": { "module_offset": "0x11a9" },
//!     "landing": "below_stack_pointer"
//! }
//! ```

use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

use crate::errors::{InjectorError, Result};

/// Where the injected code is written
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LandingStrategy {
    /// Lowest page aligned address in an unmapped gap within 32 bit reach of the slot
    #[default]
    FreeRegion,
    /// Right below the stack pointer at the breakpoint, word aligned
    BelowStackPointer,
}

/// What the function pointer slot is pointed at
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotTarget {
    /// The injected code
    #[default]
    Landing,
    /// An address inside the traced binary, relative to its base
    ModuleOffset(#[serde(deserialize_with = "offset")] usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InjectionConfig {
    /// Process to attach to, can also be given on the command line
    #[serde(default)]
    pub pid: Option<i32>,
    /// Library that contains the function, as accepted by `dlopen`
    pub library: String,
    pub symbol: String,
    /// Length of the function in bytes
    #[serde(deserialize_with = "offset")]
    pub code_len: usize,
    /// Substring of the path of the traced binary in its memory map
    pub module_name: String,
    #[serde(deserialize_with = "offset")]
    pub breakpoint_offset: usize,
    #[serde(deserialize_with = "offset")]
    pub slot_offset: usize,
    #[serde(default)]
    pub slot_target: SlotTarget,
    #[serde(default)]
    pub landing: LandingStrategy,
    /// Go on if attaching fails, because the process already is our tracee
    #[serde(default)]
    pub allow_preattached: bool,
    /// Let the process run after the redirection and report how it stops
    #[serde(default = "default_true")]
    pub resume_after: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawOffset {
    Int(u64),
    Str(String),
}

fn offset<'de, D>(deserializer: D) -> std::result::Result<usize, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = match RawOffset::deserialize(deserializer)? {
        RawOffset::Int(i) => i,
        RawOffset::Str(s) => parse_number(&s).map_err(serde::de::Error::custom)?,
    };
    usize::try_from(raw).map_err(serde::de::Error::custom)
}

/// Parses a decimal or `0x` prefixed hexadecimal number
///
/// # Errors
///
/// Returns [`InjectorError::Config`] if `s` is neither.
pub fn parse_number(s: &str) -> Result<u64> {
    let s = s.trim();
    let res = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    res.map_err(|e| InjectorError::Config(format!("{s:?} is not a number: {e}")))
}

impl InjectionConfig {
    /// Reads and validates a JSON configuration file
    ///
    /// # Errors
    ///
    /// Fails if the file can not be read, is not valid JSON for this struct, or does not pass
    /// [`Self::validate`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text)?;
        debug!("loaded config from {}: {config:?}", path.as_ref().display());
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns [`InjectorError::Config`] for an empty name or a zero code length.
    pub fn validate(&self) -> Result<()> {
        if self.code_len == 0 {
            return Err(InjectorError::Config("code_len must not be 0".into()));
        }
        for (field, value) in [
            ("library", &self.library),
            ("symbol", &self.symbol),
            ("module_name", &self.module_name),
        ] {
            if value.is_empty() {
                return Err(InjectorError::Config(format!("{field} must not be empty")));
            }
        }
        if matches!(self.pid, Some(p) if p <= 0) {
            return Err(InjectorError::Config("pid must be positive".into()));
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`InjectorError::Config`] if no pid was configured.
    pub fn pid(&self) -> Result<i32> {
        self.pid
            .ok_or_else(|| InjectorError::Config("no pid given".into()))
    }
}
