//! Configuration for the fluidic stack.
//!
//! Settings load from a TOML file with an environment-variable overlay
//! (`FLUIDIC_` prefix), then validate. Chip layouts are declared per path:
//! a bare index list makes a flat group, a `zeros`/`ones` table makes a
//! multiplexing tree.
//!
//! ```toml
//! [valve_bank]
//! host = "192.168.1.30"
//!
//! [chips.demo.paths]
//! inlet = [0, 1]
//!
//! [chips.demo.paths.mux]
//! zeros = [2, 3]
//! ones = [4, 5]
//! labels = { waste = "01" }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::{FluidicError, Result};
use crate::valves::bank::{CoilPolarity, ModbusValveBank};

/// One path's valve wiring.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PathSpec {
    /// Flat group: the listed valves open and close together.
    Flat(Vec<usize>),
    /// Multiplexing tree: complementary zero/one valve pairs plus optional
    /// extra state labels.
    Tree {
        zeros: Vec<usize>,
        ones: Vec<usize>,
        #[serde(default)]
        labels: HashMap<String, String>,
    },
}

/// Valve wiring of one chip. `BTreeMap` keeps path order deterministic.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChipLayout {
    pub paths: BTreeMap<String, PathSpec>,
}

/// Network valve bank endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ValveBankSettings {
    pub host: String,
    #[serde(default = "default_modbus_port")]
    pub port: u16,
    #[serde(default = "default_num_valves")]
    pub num_valves: usize,
    #[serde(default)]
    pub polarity: CoilPolarity,
    /// Connect and per-read timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl ValveBankSettings {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_modbus_port() -> u16 {
    502
}

fn default_num_valves() -> usize {
    ModbusValveBank::DEFAULT_NUM_VALVES
}

fn default_timeout_ms() -> u64 {
    1000
}

/// Root settings document.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub valve_bank: Option<ValveBankSettings>,
    #[serde(default)]
    pub chips: BTreeMap<String, ChipLayout>,
}

impl Settings {
    /// Load from a TOML file, with `FLUIDIC_`-prefixed environment
    /// variables taking precedence.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings: Self = Config::builder()
            .add_source(File::from(path.as_ref()))
            .add_source(Environment::with_prefix("FLUIDIC").separator("__"))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse from a TOML string (tests and embedded defaults).
    pub fn from_toml(toml: &str) -> Result<Self> {
        let settings: Self = Config::builder()
            .add_source(File::from_str(toml, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Structural checks the deserializer cannot express.
    pub fn validate(&self) -> Result<()> {
        if let Some(bank) = &self.valve_bank {
            if bank.host.is_empty() {
                return Err(FluidicError::Configuration(
                    "valve_bank.host must not be empty".to_string(),
                ));
            }
            if bank.num_valves == 0 {
                return Err(FluidicError::Configuration(
                    "valve_bank.num_valves must be nonzero".to_string(),
                ));
            }
        }
        for (chip, layout) in &self.chips {
            if layout.paths.is_empty() {
                return Err(FluidicError::Configuration(format!(
                    "chip '{}' declares no paths",
                    chip
                )));
            }
        }
        Ok(())
    }
}
