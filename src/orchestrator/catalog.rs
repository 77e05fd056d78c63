//! Workflow catalog
//!
//! Workflows are defined in YAML:
//!
//! ```yaml
//! workflows:
//!   - name: event-poster
//!     category: layout
//!     prompt: Create an A4 event poster with a red title banner.
//!     tolerance: 2.0
//!     reference:
//!       width: 595
//!       height: 842
//!       banner_fill: "#ff0000"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

use crate::bridge::Reference;
use crate::error::EvolutionError;
use crate::metrics::comparison::DEFAULT_TOLERANCE;
use crate::types::Metrics;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub name: String,
    #[serde(default = "default_category")]
    pub category: String,
    /// Instructions handed to each trial agent
    pub prompt: String,
    /// Metrics a perfect result would produce
    #[serde(default)]
    pub reference: Metrics,
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
}

fn default_category() -> String {
    "general".to_string()
}

fn default_tolerance() -> f64 {
    DEFAULT_TOLERANCE
}

impl Workflow {
    pub fn reference(&self) -> Reference {
        Reference {
            metrics: self.reference.clone(),
            tolerance: self.tolerance,
        }
    }
}

/// Which workflows a command applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    All,
    Category(String),
    Workflow(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub workflows: Vec<Workflow>,
}

impl Catalog {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let catalog: Catalog = serde_yaml::from_str(yaml).context("Failed to parse workflow catalog")?;
        let mut seen = std::collections::HashSet::new();
        for workflow in &catalog.workflows {
            if !seen.insert(workflow.name.as_str()) {
                anyhow::bail!("Duplicate workflow '{}' in catalog", workflow.name);
            }
        }
        debug!("Loaded {} workflows", catalog.workflows.len());
        Ok(catalog)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read workflow catalog {}", path.display()))?;
        Self::from_yaml(&yaml)
    }

    pub fn get(&self, name: &str) -> Option<&Workflow> {
        self.workflows.iter().find(|w| w.name == name)
    }

    /// Workflows matching `selection`. An empty match is an error.
    pub fn select(&self, selection: &Selection) -> Result<Vec<&Workflow>, EvolutionError> {
        let selected: Vec<&Workflow> = match selection {
            Selection::All => self.workflows.iter().collect(),
            Selection::Category(category) => self
                .workflows
                .iter()
                .filter(|w| w.category.eq_ignore_ascii_case(category))
                .collect(),
            Selection::Workflow(name) => self.get(name).into_iter().collect(),
        };

        if selected.is_empty() {
            let what = match selection {
                Selection::All => "catalog is empty".to_string(),
                Selection::Category(category) => format!("category {}", category),
                Selection::Workflow(name) => name.clone(),
            };
            return Err(EvolutionError::UnknownWorkflow(what));
        }
        Ok(selected)
    }
}
