//! Named flow paths on one microfluidic chip.
//!
//! A chip is an ordered set of named paths over a shared valve bank. Flat
//! paths are plain valve groups addressed together; tree paths are
//! combinatorial multiplexers with labeled states. Path order is fixed at
//! construction so snapshots and logs always list paths the same way.

use log::info;

use crate::config::{ChipLayout, PathSpec};
use crate::error::{FluidicError, Result};
use crate::valves::bank::{SharedBank, ValveState};
use crate::valves::mux::{TreeValves, Valves, STATE_CLOSED, STATE_OPEN};

/// One controllable flow path.
pub enum Path {
    Flat(Valves),
    Tree(TreeValves),
}

impl Path {
    /// Current logical state label.
    pub fn state(&self) -> Result<String> {
        match self {
            Path::Flat(group) => group.summary(),
            Path::Tree(tree) => tree.state(),
        }
    }

    /// Drive the path to a labeled state. Flat paths accept only the
    /// aggregates `"open"` and `"closed"`.
    pub fn set_state(&self, label: &str) -> Result<()> {
        match self {
            Path::Flat(group) => group.set_all(label.parse::<ValveState>()?),
            Path::Tree(tree) => tree.set_state(label),
        }
    }

    /// All labels this path accepts.
    pub fn labels(&self) -> Vec<String> {
        match self {
            Path::Flat(_) => vec![STATE_OPEN.to_string(), STATE_CLOSED.to_string()],
            Path::Tree(tree) => tree.labels(),
        }
    }
}

/// A chip: named paths in declaration order over one valve bank.
pub struct Chip {
    name: String,
    paths: Vec<(String, Path)>,
}

impl Chip {
    pub fn new(name: impl Into<String>, paths: Vec<(String, Path)>) -> Result<Self> {
        for (i, (path_name, _)) in paths.iter().enumerate() {
            if paths[..i].iter().any(|(n, _)| n == path_name) {
                return Err(FluidicError::Configuration(format!(
                    "duplicate path name '{}'",
                    path_name
                )));
            }
        }
        Ok(Self {
            name: name.into(),
            paths,
        })
    }

    /// Build the paths a layout describes over a shared bank.
    pub fn from_layout(name: impl Into<String>, bank: &SharedBank, layout: &ChipLayout) -> Result<Self> {
        let mut paths = Vec::with_capacity(layout.paths.len());
        for (path_name, spec) in &layout.paths {
            let path = match spec {
                PathSpec::Flat(indices) => Path::Flat(Valves::new(bank.clone(), indices.clone())?),
                PathSpec::Tree {
                    zeros,
                    ones,
                    labels,
                } => Path::Tree(TreeValves::new(
                    bank.clone(),
                    zeros.clone(),
                    ones.clone(),
                    labels.clone(),
                )?),
            };
            paths.push((path_name.clone(), path));
        }
        let chip = Self::new(name, paths)?;
        info!("chip '{}' configured with {} paths", chip.name, chip.paths.len());
        Ok(chip)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path_names(&self) -> Vec<&str> {
        self.paths.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn path(&self, name: &str) -> Result<&Path> {
        self.paths
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, p)| p)
            .ok_or_else(|| FluidicError::UnknownPath(name.to_string()))
    }

    pub fn state(&self, path: &str) -> Result<String> {
        self.path(path)?.state()
    }

    pub fn set_state(&self, path: &str, label: &str) -> Result<()> {
        self.path(path)?.set_state(label)
    }

    /// Open every valve on every path.
    pub fn open_all(&self) -> Result<()> {
        for (_, path) in &self.paths {
            path.set_state(STATE_OPEN)?;
        }
        Ok(())
    }

    /// Close every valve on every path.
    pub fn close_all(&self) -> Result<()> {
        for (_, path) in &self.paths {
            path.set_state(STATE_CLOSED)?;
        }
        Ok(())
    }

    /// Snapshot of every path's current state, in declaration order.
    pub fn states(&self) -> Result<Vec<(String, String)>> {
        self.paths
            .iter()
            .map(|(n, p)| Ok((n.clone(), p.state()?)))
            .collect()
    }

    /// Admissible state labels per path, in declaration order.
    pub fn path_states(&self) -> Vec<(String, Vec<String>)> {
        self.paths
            .iter()
            .map(|(n, p)| (n.clone(), p.labels()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::valves::bank::{lock_bank, shared, MemoryBank};
    use std::collections::HashMap;

    fn test_chip() -> (Chip, SharedBank) {
        let bank = shared(MemoryBank::closed(8));
        let inlet = Path::Flat(Valves::new(bank.clone(), vec![0, 1]).unwrap());
        let mux = Path::Tree(
            TreeValves::new(bank.clone(), vec![2, 3], vec![4, 5], HashMap::new()).unwrap(),
        );
        let chip = Chip::new("demo", vec![("inlet".into(), inlet), ("mux".into(), mux)]).unwrap();
        (chip, bank)
    }

    #[test]
    fn test_path_dispatch_by_name() {
        let (chip, _) = test_chip();
        chip.set_state("inlet", "open").unwrap();
        chip.set_state("mux", "2").unwrap();
        assert_eq!(chip.state("inlet").unwrap(), "open");
        assert_eq!(chip.state("mux").unwrap(), "2");
        assert!(matches!(
            chip.state("outlet"),
            Err(FluidicError::UnknownPath(_))
        ));
    }

    #[test]
    fn test_flat_path_rejects_tree_labels() {
        let (chip, _) = test_chip();
        assert!(chip.set_state("inlet", "2").is_err());
    }

    #[test]
    fn test_open_all_and_close_all() {
        let (chip, bank) = test_chip();
        chip.open_all().unwrap();
        assert!(lock_bank(&bank).states().unwrap()[0..6]
            .iter()
            .all(|s| s.is_open()));

        chip.close_all().unwrap();
        assert!(!lock_bank(&bank).states().unwrap().iter().any(|s| s.is_open()));
        assert_eq!(
            chip.states().unwrap(),
            vec![
                ("inlet".to_string(), "closed".to_string()),
                ("mux".to_string(), "closed".to_string()),
            ]
        );
    }

    #[test]
    fn test_path_states_lists_labels_in_order() {
        let (chip, _) = test_chip();
        let listing = chip.path_states();
        assert_eq!(listing[0].0, "inlet");
        assert_eq!(listing[0].1, vec!["open", "closed"]);
        assert_eq!(listing[1].0, "mux");
        assert!(listing[1].1.contains(&"3".to_string()));
    }

    #[test]
    fn test_duplicate_path_name_rejected() {
        let bank = shared(MemoryBank::closed(4));
        let a = Path::Flat(Valves::new(bank.clone(), vec![0]).unwrap());
        let b = Path::Flat(Valves::new(bank, vec![1]).unwrap());
        assert!(Chip::new("demo", vec![("x".into(), a), ("x".into(), b)]).is_err());
    }
}
