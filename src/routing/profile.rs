//! Agent routing profiles.
//!
//! A profile is static configuration describing what an agent is good at:
//! weighted keywords, intents, aliases and a division, plus the one mutable
//! field — the outcome multiplier the tracker recomputes from recent
//! results.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{HiveError, Result};

/// A keyword with its scoring weight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordEntry {
    pub word: String,
    /// Weight in [0, 1].
    pub weight: f64,
}

/// Routing profile for one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub division: String,
    #[serde(default)]
    pub keywords: Vec<KeywordEntry>,
    #[serde(default)]
    pub intents: Vec<String>,
    #[serde(default)]
    pub negative_keywords: Vec<String>,
    /// Feedback coefficient from the outcome tracker, clamped to
    /// [0.7, 1.3] at scoring time.
    #[serde(default = "default_multiplier")]
    pub outcome_multiplier: f64,
}

fn default_multiplier() -> f64 {
    1.0
}

impl AgentProfile {
    /// Minimal profile with just an id/name, for tests and defaults.
    pub fn named(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            aliases: Vec::new(),
            division: String::new(),
            keywords: Vec::new(),
            intents: Vec::new(),
            negative_keywords: Vec::new(),
            outcome_multiplier: 1.0,
        }
    }

    pub fn with_keywords(mut self, keywords: &[(&str, f64)]) -> Self {
        self.keywords = keywords
            .iter()
            .map(|(word, weight)| KeywordEntry {
                word: (*word).to_string(),
                weight: *weight,
            })
            .collect();
        self
    }

    pub fn with_intents(mut self, intents: &[&str]) -> Self {
        self.intents = intents.iter().map(|i| (*i).to_string()).collect();
        self
    }

    pub fn with_division(mut self, division: &str) -> Self {
        self.division = division.to_string();
        self
    }
}

/// Load profiles from a JSON file: either a bare array or an object with a
/// top-level `agents` array.
pub fn load_profiles(path: &Path) -> Result<Vec<AgentProfile>> {
    let raw = fs::read_to_string(path)
        .map_err(|e| HiveError::Config(format!("cannot read {}: {e}", path.display())))?;
    let value: serde_json::Value = serde_json::from_str(&raw)?;
    let list = match value.get("agents") {
        Some(agents) => agents.clone(),
        None => value,
    };
    Ok(serde_json::from_value(list)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_profiles_from_wrapped_object() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"agents": [{{"id": "daneel", "name": "Daneel",
                 "keywords": [{{"word": "disk", "weight": 0.9}}]}}]}}"#
        )
        .unwrap();

        let profiles = load_profiles(file.path()).unwrap();
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].id, "daneel");
        assert_eq!(profiles[0].outcome_multiplier, 1.0);
        assert_eq!(profiles[0].keywords[0].word, "disk");
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let err = load_profiles(Path::new("/nonexistent/profiles.json")).unwrap_err();
        assert!(matches!(err, HiveError::Config(_)));
    }
}
