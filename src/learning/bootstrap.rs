//! Tool documentation store
//!
//! Each tool's documentation is a Markdown file `<tool>.md` under the docs
//! directory, split into `### <field>` sections:
//!
//! ```text
//! # create_rectangle
//!
//! ### description
//!
//! Draws a rectangle on the active artboard.
//!
//! ### parameter:width
//!
//! Width in points.
//! ```

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use tracing::{debug, info};

use super::improvement::{is_valid_tool_name, DocField};

/// Where tool documentation is read from and written to
pub trait DocumentationStore: Send + Sync {
    /// Current text of a field; empty when the field does not exist yet
    fn read(&self, tool: &str, field: &DocField) -> Result<String>;

    /// Replace (or create) a field
    fn write(&self, tool: &str, field: &DocField, text: &str) -> Result<()>;

    /// Tools that have documentation
    fn tools(&self) -> Result<Vec<String>>;
}

/// Documentation kept as Markdown files in a directory
pub struct FileDocStore {
    base_dir: PathBuf,
}

impl FileDocStore {
    pub fn with_dir(base_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_dir)
            .with_context(|| format!("Failed to create docs directory {}", base_dir.display()))?;
        Ok(Self { base_dir })
    }

    /// Path of a tool's documentation file
    pub fn file_path(&self, tool: &str) -> Result<PathBuf> {
        if !is_valid_tool_name(tool) {
            bail!("Invalid tool name '{}'", tool);
        }
        Ok(self.base_dir.join(format!("{}.md", tool)))
    }

    fn load(&self, tool: &str) -> Result<ToolDoc> {
        let path = self.file_path(tool)?;
        if !path.exists() {
            return Ok(ToolDoc::new(tool));
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(ToolDoc::parse(&content))
    }
}

impl DocumentationStore for FileDocStore {
    fn read(&self, tool: &str, field: &DocField) -> Result<String> {
        let doc = self.load(tool)?;
        Ok(doc.section(&field.section_key()).unwrap_or_default().to_string())
    }

    fn write(&self, tool: &str, field: &DocField, text: &str) -> Result<()> {
        let path = self.file_path(tool)?;
        let mut doc = self.load(tool)?;
        doc.set_section(&field.section_key(), text);
        std::fs::write(&path, doc.render())
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Updated section '{}' in {}", field, path.display());
        Ok(())
    }

    fn tools(&self) -> Result<Vec<String>> {
        let mut tools = Vec::new();
        for entry in std::fs::read_dir(&self.base_dir).context("Failed to list docs directory")? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if is_valid_tool_name(stem) {
                    tools.push(stem.to_string());
                }
            }
        }
        tools.sort();
        debug!("Found documentation for {} tools", tools.len());
        Ok(tools)
    }
}

/// A parsed documentation file: preamble plus ordered sections
#[derive(Debug, Clone, PartialEq)]
struct ToolDoc {
    preamble: String,
    sections: Vec<(String, String)>,
}

impl ToolDoc {
    fn new(tool: &str) -> Self {
        Self {
            preamble: format!("# {}", tool),
            sections: Vec::new(),
        }
    }

    fn parse(content: &str) -> Self {
        let mut preamble = String::new();
        let mut sections: Vec<(String, String)> = Vec::new();

        for line in content.lines() {
            if let Some(header) = line.strip_prefix("### ") {
                sections.push((header.trim().to_string(), String::new()));
                continue;
            }
            let body = match sections.last_mut() {
                Some((_, body)) => body,
                None => &mut preamble,
            };
            body.push_str(line);
            body.push('\n');
        }

        Self {
            preamble: preamble.trim().to_string(),
            sections: sections
                .into_iter()
                .map(|(k, v)| (k, v.trim().to_string()))
                .collect(),
        }
    }

    fn section(&self, key: &str) -> Option<&str> {
        self.sections
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn set_section(&mut self, key: &str, text: &str) {
        let text = text.trim().to_string();
        match self.sections.iter_mut().find(|(k, _)| k == key) {
            Some((_, body)) => *body = text,
            None => self.sections.push((key.to_string(), text)),
        }
    }

    fn render(&self) -> String {
        let mut out = String::with_capacity(1024);
        if !self.preamble.is_empty() {
            out.push_str(&self.preamble);
            out.push_str("\n\n");
        }
        for (key, body) in &self.sections {
            out.push_str("### ");
            out.push_str(key);
            out.push_str("\n\n");
            if !body.is_empty() {
                out.push_str(body);
                out.push_str("\n\n");
            }
        }
        format!("{}\n", out.trim_end())
    }
}
