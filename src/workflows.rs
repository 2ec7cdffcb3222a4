//! Workflow templates.
//!
//! Unique responsibility: map a workflow tag to its JSON template on disk,
//! cache parsed templates, and patch the single customization point before
//! a template is queued on the inference server.
//!
//! Templates are files named `<WorkflowType>.json` inside a workflows
//! directory. The graph is opaque to the dispatcher except for node
//! `"111"`, whose `inputs.url_or_path` receives the prompt's input URL.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Node key of the sole customization point in every template.
pub const INPUT_NODE_KEY: &str = "111";

/// Workflow template selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkflowType {
    /// Ghibli-style image generation.
    Ghibli,
    /// Snoopy-style image generation.
    Snoopy,
    /// Video generation (gif output).
    MagicVideo,
}

impl WorkflowType {
    /// Every workflow type.
    pub const ALL: [Self; 3] = [Self::Ghibli, Self::Snoopy, Self::MagicVideo];

    /// Template name, also used as the file stem.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ghibli => "Ghibli",
            Self::Snoopy => "Snoopy",
            Self::MagicVideo => "MagicVideo",
        }
    }

    /// Template path inside a workflows directory.
    #[must_use]
    pub fn template_path(self, dir: &Path) -> PathBuf {
        dir.join(format!("{}.json", self.as_str()))
    }
}

impl FromStr for WorkflowType {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|w| w.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| WorkflowError::UnknownWorkflow(s.to_string()))
    }
}

/// Errors while loading or patching a workflow template.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// No workflow tag with this name.
    #[error("unknown workflow type: {0}")]
    UnknownWorkflow(String),
    /// The template file could not be read.
    #[error("workflow template not readable: {path:?}")]
    TemplateMissing {
        /// Path that was looked up.
        path: PathBuf,
        /// Underlying read error.
        #[source]
        source: io::Error,
    },
    /// The template file is not valid JSON.
    #[error("workflow template {path:?} is not valid json")]
    TemplateInvalid {
        /// Path that was parsed.
        path: PathBuf,
        /// Underlying parse error.
        #[source]
        source: serde_json::Error,
    },
    /// The template carries no patchable input node.
    #[error("workflow {0:?} has no input node \"111\"")]
    InputNodeMissing(WorkflowType),
}

/// Filesystem-backed template store with a per-type parse cache.
pub struct WorkflowStore {
    dir: PathBuf,
    cache: Mutex<HashMap<WorkflowType, Value>>,
}

impl WorkflowStore {
    /// Create a store rooted at `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Directory the store reads templates from.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Return the template for `workflow_type` with `input_url` patched
    /// into node `"111"`'s `inputs.url_or_path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the template is missing, unparsable, or has no
    /// patchable input node.
    pub fn prepared(
        &self,
        workflow_type: WorkflowType,
        input_url: &str,
    ) -> Result<Value, WorkflowError> {
        let mut doc = self.template(workflow_type)?;

        let inputs = doc
            .get_mut(INPUT_NODE_KEY)
            .and_then(|node| node.get_mut("inputs"))
            .and_then(Value::as_object_mut)
            .ok_or(WorkflowError::InputNodeMissing(workflow_type))?;
        inputs.insert(
            "url_or_path".to_string(),
            Value::String(input_url.to_string()),
        );

        Ok(doc)
    }

    /// Load (and cache) the parsed template for `workflow_type`.
    fn template(&self, workflow_type: WorkflowType) -> Result<Value, WorkflowError> {
        if let Some(doc) = self.cache.lock().get(&workflow_type) {
            return Ok(doc.clone());
        }

        let path = workflow_type.template_path(&self.dir);
        let raw = std::fs::read(&path).map_err(|source| WorkflowError::TemplateMissing {
            path: path.clone(),
            source,
        })?;
        let doc: Value = serde_json::from_slice(&raw)
            .map_err(|source| WorkflowError::TemplateInvalid { path, source })?;

        self.cache.lock().insert(workflow_type, doc.clone());
        Ok(doc)
    }
}
