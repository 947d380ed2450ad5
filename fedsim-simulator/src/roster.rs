//! The collaborator roster and the per-collaborator data configuration.
//!
//! The roster is a plain text file with one collaborator id per line;
//! blank lines and `#` comments are skipped. The data configuration is a
//! TOML file mapping each collaborator id to its local data.

use std::{
    collections::BTreeMap,
    fs,
    io,
    path::{Path, PathBuf},
};

use config::{Config, ConfigError};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
/// An error related to loading the roster or the data configuration.
pub enum RosterError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("data configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("the roster names no collaborators")]
    Empty,
    #[error("collaborator {0} appears more than once in the roster")]
    Duplicate(String),
    #[error("no data configured for roster collaborator(s): {}", .missing.join(", "))]
    MissingData { missing: Vec<String> },
}

/// The ordered list of collaborator ids taking part in a federation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Roster {
    ids: Vec<String>,
}

impl Roster {
    /// Loads a roster from a plain text file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RosterError> {
        let contents = fs::read_to_string(path.as_ref()).map_err(|source| RosterError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        })?;
        Self::parse(&contents)
    }

    /// Parses a roster from its file contents.
    pub fn parse(contents: &str) -> Result<Self, RosterError> {
        let mut ids = Vec::new();
        for line in contents.lines() {
            let id = line.split('#').next().unwrap_or("").trim();
            if id.is_empty() {
                continue;
            }
            if ids.iter().any(|existing| existing == id) {
                return Err(RosterError::Duplicate(id.to_string()));
            }
            ids.push(id.to_string());
        }
        if ids.is_empty() {
            return Err(RosterError::Empty);
        }
        Ok(Self { ids })
    }

    /// Gets the collaborator ids in roster order.
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    /// Gets the number of collaborators.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Checks whether the roster is empty. Never true for a loaded roster.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// The local data of one collaborator.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct CollaboratorData {
    /// The path the collaborator's model reads its training data from.
    pub data_path: PathBuf,
    /// The number of local training samples; used for sample-count
    /// weighted aggregation.
    pub sample_count: Option<u64>,
}

/// The per-collaborator data configuration.
///
/// # Examples
///
/// **TOML**
/// ```text
/// [collaborators.clinic-a]
/// data_path = "data/clinic-a"
/// sample_count = 1200
/// ```
#[derive(Debug, Deserialize, Clone, Default)]
pub struct DataConfig {
    #[serde(default)]
    pub collaborators: BTreeMap<String, CollaboratorData>,
}

impl DataConfig {
    /// Loads the data configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RosterError> {
        let mut config = Config::new();
        config.merge(config::File::from(path.as_ref()))?;
        Ok(config.try_into()?)
    }

    /// Gets the data of one collaborator.
    pub fn get(&self, id: &str) -> Option<&CollaboratorData> {
        self.collaborators.get(id)
    }

    /// Checks that every roster collaborator has configured data.
    pub fn check_roster(&self, roster: &Roster) -> Result<(), RosterError> {
        let missing: Vec<String> = roster
            .ids()
            .iter()
            .filter(|id| !self.collaborators.contains_key(*id))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(RosterError::MissingData { missing });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roster_parsing() {
        let roster = Roster::parse(
            "# the pilot sites\nclinic-a\n\nclinic-b # joined later\n  clinic-c  \n",
        )
        .unwrap();
        assert_eq!(roster.ids(), &["clinic-a", "clinic-b", "clinic-c"]);
    }

    #[test]
    fn test_empty_roster_is_rejected() {
        assert!(matches!(
            Roster::parse("# nothing but comments\n\n").unwrap_err(),
            RosterError::Empty
        ));
    }

    #[test]
    fn test_duplicate_id_is_rejected() {
        assert!(matches!(
            Roster::parse("clinic-a\nclinic-a\n").unwrap_err(),
            RosterError::Duplicate(id) if id == "clinic-a"
        ));
    }

    #[test]
    fn test_check_roster_reports_missing_data() {
        let roster = Roster::parse("clinic-a\nclinic-b\n").unwrap();
        let mut config = DataConfig::default();
        config.collaborators.insert(
            "clinic-a".to_string(),
            CollaboratorData {
                data_path: PathBuf::from("data/clinic-a"),
                sample_count: Some(100),
            },
        );
        assert!(matches!(
            config.check_roster(&roster).unwrap_err(),
            RosterError::MissingData { missing } if missing == vec!["clinic-b".to_string()]
        ));

        config.collaborators.insert(
            "clinic-b".to_string(),
            CollaboratorData {
                data_path: PathBuf::from("data/clinic-b"),
                sample_count: None,
            },
        );
        assert!(config.check_roster(&roster).is_ok());
    }
}
