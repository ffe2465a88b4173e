//! Built-in scenario families and the static table that names them.

pub mod classification;
pub mod constraint;
pub mod convergence;
pub mod tool_use;

use std::sync::Arc;

use regex::Regex;
use thiserror::Error;

use crate::scenario::{Scenario, TaskFamily};

pub use classification::ClassificationScenario;
pub use constraint::ConstraintScenario;
pub use convergence::ConvergenceScenario;
pub use tool_use::ToolUseScenario;

pub type ScenarioConstructor = fn() -> Arc<dyn Scenario>;

fn classification() -> Arc<dyn Scenario> {
    Arc::new(ClassificationScenario::new())
}

fn constraint() -> Arc<dyn Scenario> {
    Arc::new(ConstraintScenario::new())
}

fn tool_use() -> Arc<dyn Scenario> {
    Arc::new(ToolUseScenario::new())
}

fn convergence() -> Arc<dyn Scenario> {
    Arc::new(ConvergenceScenario::new())
}

/// Every scenario the harness can run, keyed by id.
pub static BUILTIN_SCENARIOS: &[(&str, ScenarioConstructor)] = &[
    (classification::ID, classification),
    (constraint::ID, constraint),
    (tool_use::ID, tool_use),
    (convergence::ID, convergence),
];

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no scenario matches `{0}`")]
    NoMatch(String),
    #[error("invalid scenario pattern `{pattern}`: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

pub fn create(id: &str) -> Option<Arc<dyn Scenario>> {
    BUILTIN_SCENARIOS
        .iter()
        .find(|(known, _)| *known == id)
        .map(|(_, constructor)| constructor())
}

pub fn list(family: Option<TaskFamily>) -> Vec<Arc<dyn Scenario>> {
    BUILTIN_SCENARIOS
        .iter()
        .map(|(_, constructor)| constructor())
        .filter(|scenario| family.map_or(true, |f| scenario.config().family == f))
        .collect()
}

fn matcher(pattern: &str) -> Result<Box<dyn Fn(&str) -> bool>, RegistryError> {
    if pattern == "all" {
        return Ok(Box::new(|_: &str| true));
    }
    if let Some(family) = TaskFamily::parse(pattern) {
        let prefix = format!("{}/", family.as_str());
        return Ok(Box::new(move |id: &str| id.starts_with(&prefix)));
    }
    if pattern.contains('*') {
        let source = format!("^{}$", regex::escape(pattern).replace(r"\*", ".*"));
        let re = Regex::new(&source).map_err(|source| RegistryError::Pattern {
            pattern: pattern.to_string(),
            source,
        })?;
        return Ok(Box::new(move |id: &str| re.is_match(id)));
    }
    let exact = pattern.to_string();
    Ok(Box::new(move |id: &str| id == exact))
}

/// Resolves `all`, family names, `*` globs and exact ids into scenarios,
/// sorted by id with duplicates removed. A pattern that matches nothing
/// is an error.
pub fn resolve<S: AsRef<str>>(patterns: &[S]) -> Result<Vec<Arc<dyn Scenario>>, RegistryError> {
    let mut ids: Vec<&'static str> = Vec::new();
    for pattern in patterns {
        let pattern = pattern.as_ref().trim();
        let matches = matcher(pattern)?;
        let before = ids.len();
        ids.extend(BUILTIN_SCENARIOS.iter().map(|(id, _)| *id).filter(|id| matches(id)));
        if ids.len() == before {
            return Err(RegistryError::NoMatch(pattern.to_string()));
        }
    }
    ids.sort_unstable();
    ids.dedup();
    Ok(ids.into_iter().filter_map(create).collect())
}
