//! Combinatorial valve multiplexing.
//!
//! A [`Valves`] group is an ordered list of physical valve indices acting as
//! one logical bank. A [`TreeValves`] group is N complementary valve *pairs*
//! (a zero-path valve and a one-path valve per bit) encoding one of 2^N
//! logical flow paths on a branching chip; each bit pattern carries a stable
//! human-meaningful label.
//!
//! Pattern alphabet, one character per pair:
//! - `0` - only the zero-path valve open
//! - `1` - only the one-path valve open
//! - `o` - both valves open (wildcard pair)
//! - `x` - neither valve open
//!
//! The aggregate states `"open"` (all valves open) and `"closed"` (all
//! closed) bypass the pattern table; any physical combination that matches
//! no registered label reads back as `"invalid"`.

use std::collections::HashMap;

use log::debug;

use crate::error::{FluidicError, Result};
use crate::valves::bank::{lock_bank, SharedBank, ValveState};

/// Aggregate state names shared by flat and tree groups.
pub const STATE_OPEN: &str = "open";
pub const STATE_CLOSED: &str = "closed";
pub const STATE_INVALID: &str = "invalid";

/// An ordered group of physical valves addressed as one logical bank.
pub struct Valves {
    indices: Vec<usize>,
    bank: SharedBank,
}

impl Valves {
    pub fn new(bank: SharedBank, indices: Vec<usize>) -> Result<Self> {
        let len = lock_bank(&bank).len();
        for &index in &indices {
            if index >= len {
                return Err(FluidicError::ValveIndex { index, len });
            }
        }
        Ok(Self { indices, bank })
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// State of the group's `pos`-th valve.
    pub fn get(&self, pos: usize) -> Result<ValveState> {
        let index = *self.indices.get(pos).ok_or(FluidicError::ValveIndex {
            index: pos,
            len: self.indices.len(),
        })?;
        lock_bank(&self.bank).read(index)
    }

    pub fn set(&self, pos: usize, state: ValveState) -> Result<()> {
        let index = *self.indices.get(pos).ok_or(FluidicError::ValveIndex {
            index: pos,
            len: self.indices.len(),
        })?;
        lock_bank(&self.bank).write(index, state)
    }

    pub fn set_all(&self, state: ValveState) -> Result<()> {
        let mut bank = lock_bank(&self.bank);
        for &index in &self.indices {
            bank.write(index, state)?;
        }
        Ok(())
    }

    pub fn states(&self) -> Result<Vec<ValveState>> {
        let mut bank = lock_bank(&self.bank);
        self.indices.iter().map(|&i| bank.read(i)).collect()
    }

    /// Group equality: `"open"` iff every member reads open, `"closed"` iff
    /// none does.
    pub fn is(&self, state: ValveState) -> Result<bool> {
        let states = self.states()?;
        Ok(match state {
            ValveState::Open => states.iter().all(|s| s.is_open()),
            ValveState::Closed => !states.iter().any(|s| s.is_open()),
        })
    }

    /// Snapshot summary: `"closed"` when no member is open, else `"open"`.
    pub fn summary(&self) -> Result<String> {
        Ok(if self.is(ValveState::Closed)? {
            STATE_CLOSED.to_string()
        } else {
            STATE_OPEN.to_string()
        })
    }
}

/// N complementary valve pairs selecting one of 2^N logical paths.
pub struct TreeValves {
    zeros: Vec<usize>,
    ones: Vec<usize>,
    labels_to_patterns: HashMap<String, String>,
    patterns_to_labels: HashMap<String, String>,
    bank: SharedBank,
}

impl TreeValves {
    /// Build a tree group. `labels` may bind extra names to patterns over
    /// the `{0,1,o,x}` alphabet; decimal labels for every pure bit pattern
    /// are always present as defaults.
    pub fn new(
        bank: SharedBank,
        zeros: Vec<usize>,
        ones: Vec<usize>,
        labels: HashMap<String, String>,
    ) -> Result<Self> {
        let pairs = zeros.len();
        if pairs == 0 || pairs != ones.len() {
            return Err(FluidicError::Configuration(format!(
                "tree needs equal-length nonempty zero/one lists (got {} and {})",
                zeros.len(),
                ones.len()
            )));
        }
        if pairs > 16 {
            return Err(FluidicError::Configuration(format!(
                "{} valve pairs is beyond the {}-pair label table limit",
                pairs, 16
            )));
        }
        if zeros.iter().any(|z| ones.contains(z)) {
            return Err(FluidicError::Configuration(
                "zero-path and one-path valve lists must be disjoint".to_string(),
            ));
        }
        let len = lock_bank(&bank).len();
        for &index in zeros.iter().chain(ones.iter()) {
            if index >= len {
                return Err(FluidicError::ValveIndex { index, len });
            }
        }

        let mut custom = HashMap::new();
        for (label, pattern) in labels {
            if pattern.len() != pairs {
                return Err(FluidicError::Configuration(format!(
                    "state pattern '{}' must have length {}",
                    pattern, pairs
                )));
            }
            if !pattern.chars().all(|c| matches!(c, '0' | '1' | 'o' | 'x')) {
                return Err(FluidicError::Configuration(format!(
                    "state pattern '{}' may only contain 0, 1, o, and x",
                    pattern
                )));
            }
            custom.insert(label, pattern);
        }

        // Every pure path keeps its default decimal label; custom labels
        // take precedence both ways, so a named pattern reads back by name.
        let mut labels_to_patterns = custom.clone();
        for i in 0..(1usize << pairs) {
            labels_to_patterns
                .entry(i.to_string())
                .or_insert_with(|| format!("{:0width$b}", i, width = pairs));
        }
        let mut patterns_to_labels = HashMap::new();
        for i in 0..(1usize << pairs) {
            let label = i.to_string();
            if let Some(pattern) = labels_to_patterns.get(&label) {
                patterns_to_labels.insert(pattern.clone(), label);
            }
        }
        for (label, pattern) in &custom {
            patterns_to_labels.insert(pattern.clone(), label.clone());
        }

        Ok(Self {
            zeros,
            ones,
            labels_to_patterns,
            patterns_to_labels,
            bank,
        })
    }

    /// Number of valve pairs (bits).
    pub fn pairs(&self) -> usize {
        self.zeros.len()
    }

    /// All admissible labels, aggregates first.
    pub fn labels(&self) -> Vec<String> {
        let mut labels = vec![STATE_OPEN.to_string(), STATE_CLOSED.to_string()];
        let mut named: Vec<String> = self.labels_to_patterns.keys().cloned().collect();
        named.sort();
        labels.extend(named);
        labels
    }

    /// Read all valves and classify the current logical state.
    pub fn state(&self) -> Result<String> {
        let mut bank = lock_bank(&self.bank);
        let zeros_open: Vec<bool> = self
            .zeros
            .iter()
            .map(|&i| bank.read(i).map(ValveState::is_open))
            .collect::<Result<_>>()?;
        let ones_open: Vec<bool> = self
            .ones
            .iter()
            .map(|&i| bank.read(i).map(ValveState::is_open))
            .collect::<Result<_>>()?;
        drop(bank);

        let any = zeros_open.iter().chain(ones_open.iter()).any(|&b| b);
        let all = zeros_open.iter().chain(ones_open.iter()).all(|&b| b);
        if all {
            return Ok(STATE_OPEN.to_string());
        }
        if !any {
            return Ok(STATE_CLOSED.to_string());
        }

        let pattern: String = zeros_open
            .iter()
            .zip(ones_open.iter())
            .map(|(&z, &o)| match (z, o) {
                (true, true) => 'o',
                (true, false) => '0',
                (false, true) => '1',
                (false, false) => 'x',
            })
            .collect();
        Ok(self
            .patterns_to_labels
            .get(&pattern)
            .cloned()
            .unwrap_or_else(|| STATE_INVALID.to_string()))
    }

    /// Drive the valves to a labeled state.
    ///
    /// The aggregates `"open"`/`"closed"` set all valves directly. Any other
    /// label closes all 2N valves first and only then opens the pattern's
    /// valves, so two mutually exclusive paths are never transiently open
    /// together.
    pub fn set_state(&self, label: &str) -> Result<()> {
        let mut bank = lock_bank(&self.bank);
        match label {
            STATE_OPEN => {
                for &i in self.zeros.iter().chain(self.ones.iter()) {
                    bank.write(i, ValveState::Open)?;
                }
            }
            STATE_CLOSED => {
                for &i in self.zeros.iter().chain(self.ones.iter()) {
                    bank.write(i, ValveState::Closed)?;
                }
            }
            _ => {
                let pattern = self
                    .labels_to_patterns
                    .get(label)
                    .ok_or_else(|| FluidicError::UnknownLabel(label.to_string()))?;
                for &i in self.zeros.iter().chain(self.ones.iter()) {
                    bank.write(i, ValveState::Closed)?;
                }
                for (pos, c) in pattern.chars().enumerate() {
                    match c {
                        'o' => {
                            bank.write(self.zeros[pos], ValveState::Open)?;
                            bank.write(self.ones[pos], ValveState::Open)?;
                        }
                        '1' => bank.write(self.ones[pos], ValveState::Open)?,
                        '0' => bank.write(self.zeros[pos], ValveState::Open)?,
                        _ => {}
                    }
                }
            }
        }
        debug!("tree state -> {}", label);
        Ok(())
    }
}
