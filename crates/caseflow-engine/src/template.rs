//! Workflow templates and one-time parameter substitution.
//!
//! A `WorkflowTemplate` is the YAML-loadable blueprint a `Workflow` is minted
//! from. Substitution happens exactly once, at instantiation: every
//! `{{ params.<name> }}` marker in step inputs and metadata is replaced with
//! the supplied parameter value. Unknown references are left as-is (not an
//! error). The minted workflow is immutable afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use caseflow_types::workflow::{ExecutionMode, TriggerKind, Workflow, WorkflowStep};
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum TemplateError {
    /// No template registered under the given name.
    #[error("template not found: {0}")]
    NotFound(String),

    /// The template file failed to parse.
    #[error("template parse error: {0}")]
    Parse(#[from] serde_yaml_ng::Error),
}

// ---------------------------------------------------------------------------
// WorkflowTemplate
// ---------------------------------------------------------------------------

/// Blueprint for a workflow: steps plus mode, minus per-run identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    /// Template name, unique within a store.
    pub name: String,
    /// What this workflow does.
    #[serde(default)]
    pub description: String,
    /// Topology strategy for workflows minted from this template.
    pub execution_mode: ExecutionMode,
    /// Steps, with `{{ params.* }}` markers still unresolved.
    pub steps: Vec<WorkflowStep>,
    /// How minted workflows may be started.
    #[serde(default)]
    pub triggers: Vec<TriggerKind>,
    /// Workflow-level timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Mode-specific parameters, also subject to substitution.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl WorkflowTemplate {
    /// Mint a `Workflow` from this template, substituting `params` into step
    /// inputs, step metadata, and workflow metadata.
    pub fn instantiate(&self, params: &HashMap<String, Value>) -> Workflow {
        let steps = self
            .steps
            .iter()
            .map(|step| {
                let mut step = step.clone();
                step.inputs = step
                    .inputs
                    .iter()
                    .map(|(k, v)| (k.clone(), substitute_value(v, params)))
                    .collect();
                step.metadata = step
                    .metadata
                    .iter()
                    .map(|(k, v)| (k.clone(), substitute_value(v, params)))
                    .collect();
                step
            })
            .collect();

        let metadata = self
            .metadata
            .iter()
            .map(|(k, v)| (k.clone(), substitute_value(v, params)))
            .collect();

        Workflow {
            id: Uuid::now_v7(),
            name: self.name.clone(),
            steps,
            execution_mode: self.execution_mode,
            triggers: if self.triggers.is_empty() {
                vec![TriggerKind::Manual]
            } else {
                self.triggers.clone()
            },
            timeout_secs: self.timeout_secs,
            created_at: Utc::now(),
            metadata,
        }
    }
}

// ---------------------------------------------------------------------------
// TemplateStore
// ---------------------------------------------------------------------------

/// In-memory registry of workflow templates, keyed by name.
#[derive(Debug, Default)]
pub struct TemplateStore {
    templates: DashMap<String, Arc<WorkflowTemplate>>,
}

impl TemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a template, replacing any previous one with the same name.
    pub fn register(&self, template: WorkflowTemplate) {
        tracing::debug!(template = template.name.as_str(), "template registered");
        self.templates
            .insert(template.name.clone(), Arc::new(template));
    }

    /// Look up a template by name.
    pub fn get(&self, name: &str) -> Result<Arc<WorkflowTemplate>, TemplateError> {
        self.templates
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| TemplateError::NotFound(name.to_string()))
    }

    /// Names of all registered templates, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.templates.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Parse a YAML template definition and register it.
    pub fn load_yaml_str(&self, input: &str) -> Result<String, TemplateError> {
        let template: WorkflowTemplate = serde_yaml_ng::from_str(input)?;
        let name = template.name.clone();
        self.register(template);
        Ok(name)
    }
}

// ---------------------------------------------------------------------------
// Substitution
// ---------------------------------------------------------------------------

/// Substitute `{{ params.<name> }}` markers within a JSON value.
///
/// A string that is exactly one marker takes the parameter's JSON value
/// directly, preserving its type; otherwise markers are replaced inline as
/// display strings. Objects and arrays are walked recursively.
fn substitute_value(value: &Value, params: &HashMap<String, Value>) -> Value {
    match value {
        Value::String(s) => {
            if let Some(name) = exact_marker(s) {
                if let Some(param) = params.get(name) {
                    return param.clone();
                }
            }
            Value::String(substitute_str(s, params))
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| substitute_value(item, params))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute_value(v, params)))
                .collect(),
        ),
        other => other.clone(),
    }
}

const MARKER_OPEN: &str = "{{ params.";
const MARKER_CLOSE: &str = " }}";

/// When the whole string is a single marker, return the parameter name.
fn exact_marker(input: &str) -> Option<&str> {
    let inner = input
        .strip_prefix(MARKER_OPEN)?
        .strip_suffix(MARKER_CLOSE)?
        .trim();
    (!inner.is_empty() && !inner.contains("{{")).then_some(inner)
}

/// Replace every `{{ params.<name> }}` marker inline. Unknown references are
/// left untouched.
fn substitute_str(input: &str, params: &HashMap<String, Value>) -> String {
    let mut result = input.to_string();
    let mut search_from = 0;
    while let Some(rel) = result[search_from..].find(MARKER_OPEN) {
        let start = search_from + rel;
        let Some(end_rel) = result[start..].find(MARKER_CLOSE) else {
            break;
        };
        let end = start + end_rel + MARKER_CLOSE.len();
        let name = result[start + MARKER_OPEN.len()..end - MARKER_CLOSE.len()].trim();
        match params.get(name) {
            Some(value) => {
                let replacement = value_to_string(value);
                result.replace_range(start..end, &replacement);
                search_from = start + replacement.len();
            }
            // Unknown reference stays as-is; resume after it
            None => search_from = end,
        }
    }
    result
}

/// Convert a parameter value to a display string for inline substitution.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        // Objects/arrays become compact JSON
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use caseflow_types::workflow::DependencyKind;
    use serde_json::json;

    fn template_with_inputs(inputs: serde_json::Map<String, Value>) -> WorkflowTemplate {
        WorkflowTemplate {
            name: "case-triage".to_string(),
            description: "Collect and analyze case records".to_string(),
            execution_mode: ExecutionMode::Sequential,
            steps: vec![WorkflowStep {
                id: "collect".to_string(),
                name: "Collect".to_string(),
                step_type: "data_collection".to_string(),
                inputs,
                resource_requirements: HashMap::new(),
                timeout_secs: None,
                retry: None,
                depends_on: vec![],
                dependency_kind: DependencyKind::Sequential,
                conditions: vec![],
                metadata: HashMap::new(),
            }],
            triggers: vec![],
            timeout_secs: Some(600),
            metadata: HashMap::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Substitution
    // -----------------------------------------------------------------------

    #[test]
    fn inline_substitution_in_strings() {
        let params = HashMap::from([("region".to_string(), json!("north"))]);
        let out = substitute_str("records for {{ params.region }} district", &params);
        assert_eq!(out, "records for north district");
    }

    #[test]
    fn exact_marker_preserves_json_type() {
        let params = HashMap::from([("limit".to_string(), json!(50))]);
        let out = substitute_value(&json!("{{ params.limit }}"), &params);
        assert_eq!(out, json!(50));
    }

    #[test]
    fn unknown_reference_left_as_is() {
        let params = HashMap::new();
        let out = substitute_str("{{ params.missing }} stays", &params);
        assert_eq!(out, "{{ params.missing }} stays");
    }

    #[test]
    fn multiple_markers_in_one_string() {
        let params = HashMap::from([
            ("a".to_string(), json!("x")),
            ("b".to_string(), json!(2)),
        ]);
        let out = substitute_str("{{ params.a }} and {{ params.b }}", &params);
        assert_eq!(out, "x and 2");
    }

    #[test]
    fn substitution_walks_nested_values() {
        let params = HashMap::from([("source".to_string(), json!("court-records"))]);
        let nested = json!({
            "sources": ["{{ params.source }}", "registry"],
            "query": {"from": "{{ params.source }} archive"}
        });
        let out = substitute_value(&nested, &params);
        assert_eq!(out["sources"][0], json!("court-records"));
        assert_eq!(out["query"]["from"], json!("court-records archive"));
    }

    // -----------------------------------------------------------------------
    // Instantiation
    // -----------------------------------------------------------------------

    #[test]
    fn instantiate_substitutes_step_inputs() {
        let mut inputs = serde_json::Map::new();
        inputs.insert("source".to_string(), json!("{{ params.source }}"));
        inputs.insert("limit".to_string(), json!("{{ params.limit }}"));
        let template = template_with_inputs(inputs);

        let params = HashMap::from([
            ("source".to_string(), json!("court-records")),
            ("limit".to_string(), json!(25)),
        ]);
        let wf = template.instantiate(&params);
        assert_eq!(wf.name, "case-triage");
        assert_eq!(wf.steps[0].inputs["source"], json!("court-records"));
        assert_eq!(wf.steps[0].inputs["limit"], json!(25));
        assert_eq!(wf.timeout_secs, Some(600));
        assert_eq!(wf.triggers, vec![TriggerKind::Manual]);
    }

    #[test]
    fn instantiate_mints_fresh_ids() {
        let template = template_with_inputs(serde_json::Map::new());
        let params = HashMap::new();
        let a = template.instantiate(&params);
        let b = template.instantiate(&params);
        assert_ne!(a.id, b.id);
    }

    // -----------------------------------------------------------------------
    // Store
    // -----------------------------------------------------------------------

    #[test]
    fn register_and_get() {
        let store = TemplateStore::new();
        store.register(template_with_inputs(serde_json::Map::new()));
        assert!(store.get("case-triage").is_ok());
        assert!(matches!(
            store.get("missing").unwrap_err(),
            TemplateError::NotFound(_)
        ));
        assert_eq!(store.names(), vec!["case-triage"]);
    }

    #[test]
    fn load_yaml_template() {
        let store = TemplateStore::new();
        let name = store
            .load_yaml_str(
                r#"
name: evidence-review
description: Review evidence bundles
execution_mode: parallel
steps:
  - id: fetch
    name: Fetch bundle
    step_type: data_collection
    inputs:
      source: "{{ params.source }}"
  - id: score
    name: Score bundle
    step_type: analysis
    depends_on: [fetch]
    retry:
      max_retries: 2
"#,
            )
            .unwrap();
        assert_eq!(name, "evidence-review");

        let template = store.get("evidence-review").unwrap();
        assert_eq!(template.execution_mode, ExecutionMode::Parallel);
        assert_eq!(template.steps.len(), 2);
        assert_eq!(template.steps[1].depends_on, vec!["fetch"]);
        assert_eq!(template.steps[1].retry.unwrap().max_retries, 2);
        assert_eq!(template.steps[1].retry.unwrap().backoff_secs, 5);
    }

    #[test]
    fn malformed_yaml_is_a_parse_error() {
        let store = TemplateStore::new();
        let err = store.load_yaml_str("name: [unclosed").unwrap_err();
        assert!(matches!(err, TemplateError::Parse(_)));
    }
}
