//! User functions and the pipelines ("profile builders") that chain them.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::Timestamp;

/// A single user script plus the hash used for change detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionConfig {
    pub id: String,
    pub name: String,
    pub code: String,
    pub code_hash: String,
    pub workspace_id: String,
}

impl FunctionConfig {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        code: impl Into<String>,
        code_hash: impl Into<String>,
        workspace_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            code: code.into(),
            code_hash: code_hash.into(),
            workspace_id: workspace_id.into(),
        }
    }
}

/// An ordered list of function references belonging to one workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSpec {
    pub id: String,
    pub workspace_id: String,
    pub version: u64,
    pub function_refs: Vec<String>,
    pub updated_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_until: Option<Timestamp>,
}

impl PipelineSpec {
    pub fn new(
        id: impl Into<String>,
        workspace_id: impl Into<String>,
        version: u64,
        function_refs: Vec<String>,
        updated_at: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            workspace_id: workspace_id.into(),
            version,
            function_refs,
            updated_at,
            debug_until: None,
        }
    }
}

/// A pipeline with its function references resolved, in declaration order.
///
/// This is the unit the engine compiles into one sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineBundle {
    pub spec: PipelineSpec,
    pub functions: Vec<FunctionConfig>,
}

impl PipelineBundle {
    pub fn new(spec: PipelineSpec, functions: Vec<FunctionConfig>) -> Self {
        Self { spec, functions }
    }

    /// Resolve `spec.function_refs` against a function table.
    ///
    /// Returns the first unknown function id on failure.
    pub fn resolve(
        spec: PipelineSpec,
        functions: &HashMap<String, FunctionConfig>,
    ) -> Result<Self, String> {
        let resolved = spec
            .function_refs
            .iter()
            .map(|id| functions.get(id).cloned().ok_or_else(|| id.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(spec, resolved))
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    /// Ordered `(function id, code hash)` pairs, `updated_at` and `version`.
    ///
    /// Two bundles with equal fingerprints compile to equivalent sandboxes.
    pub fn fingerprint(&self) -> (Vec<(&str, &str)>, Timestamp, u64) {
        let hashes = self
            .functions
            .iter()
            .map(|f| (f.id.as_str(), f.code_hash.as_str()))
            .collect();
        (hashes, self.spec.updated_at, self.spec.version)
    }
}
