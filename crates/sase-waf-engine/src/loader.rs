//! Rule file loading
//!
//! A [`WafConfig`] is an ordered list of rule sources. Each source is a
//! literal path, a glob pattern, or inline YAML. Sources are read in
//! order; settings from later files override earlier ones and rules
//! keep their load order.

use crate::rules::{RuleDef, Ruleset};
use crate::types::{EngineSettings, SettingsPatch};
use crate::{EngineError, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Contents of one rule file
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleFile {
    #[serde(default)]
    engine: Option<SettingsPatch>,
    #[serde(default)]
    rules: Vec<RuleDef>,
}

#[derive(Clone, Debug)]
enum Source {
    File(String),
    Inline(String),
}

/// Ordered rule source list
#[derive(Clone, Debug, Default)]
pub struct WafConfig {
    sources: Vec<Source>,
}

impl WafConfig {
    /// Empty configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a rule file path or glob pattern
    pub fn with_directives_from_file(mut self, pattern: impl Into<String>) -> Self {
        self.sources.push(Source::File(pattern.into()));
        self
    }

    /// Append inline YAML
    pub fn with_directives(mut self, yaml: impl Into<String>) -> Self {
        self.sources.push(Source::Inline(yaml.into()));
        self
    }

    /// Number of configured sources
    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Read and compile every source
    pub fn build(&self) -> Result<Ruleset> {
        let mut settings = EngineSettings::default();
        let mut defs = Vec::new();

        for source in &self.sources {
            match source {
                Source::Inline(yaml) => {
                    merge(parse(yaml, "<inline>")?, &mut settings, &mut defs);
                }
                Source::File(pattern) => {
                    for path in resolve(pattern)? {
                        let content = std::fs::read_to_string(&path).map_err(|e| EngineError::RuleFile {
                            path: path.display().to_string(),
                            source: e,
                        })?;
                        merge(parse(&content, &path.display().to_string())?, &mut settings, &mut defs);
                        tracing::debug!(path = %path.display(), "loaded rule file");
                    }
                }
            }
        }

        let ruleset = Ruleset::compile(settings, &defs)?;
        tracing::info!(
            rules = ruleset.len(),
            mode = ?ruleset.settings.rule_engine,
            "rule set compiled"
        );
        Ok(ruleset)
    }
}

fn parse(content: &str, origin: &str) -> Result<RuleFile> {
    if content.trim().is_empty() {
        return Ok(RuleFile::default());
    }
    serde_yaml::from_str(content).map_err(|e| EngineError::Parse {
        path: origin.to_string(),
        reason: e.to_string(),
    })
}

fn merge(file: RuleFile, settings: &mut EngineSettings, defs: &mut Vec<RuleDef>) {
    if let Some(patch) = &file.engine {
        settings.apply(patch);
    }
    defs.extend(file.rules);
}

fn is_glob(pattern: &str) -> bool {
    pattern.contains(&['*', '?', '['][..])
}

/// Expand a source into concrete paths
///
/// Literal paths must exist; globs may match nothing.
fn resolve(pattern: &str) -> Result<Vec<PathBuf>> {
    if !is_glob(pattern) {
        let path = Path::new(pattern);
        if !path.exists() {
            return Err(EngineError::RuleFileNotFound(pattern.to_string()));
        }
        return Ok(vec![path.to_path_buf()]);
    }

    let entries = glob::glob(pattern).map_err(|e| EngineError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })?;

    let mut paths = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| EngineError::RuleFile {
            path: e.path().display().to_string(),
            source: e.into_error(),
        })?;
        if path.is_file() {
            paths.push(path);
        }
    }

    if paths.is_empty() {
        tracing::debug!(pattern, "rule file pattern matched nothing");
    }
    Ok(paths)
}
