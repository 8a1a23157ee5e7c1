//! Specification importers.
//!
//! Each dialect parses raw document bytes into canonical [`Service`] values.
//! Structural failures abort the import; semantic gaps in one operation,
//! example, header set or binding are recorded as [`ImportWarning`]s and the
//! import carries on.

pub mod asyncapi;
pub mod openapi;

pub use asyncapi::AsyncApiImporter;
pub use openapi::OpenApiImporter;

use crate::config::{DocumentFormat, ImporterSettings};
use crate::model::Service;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Fatal import failures.
#[derive(Debug, Error)]
pub enum ImportError {
    /// The document is not structurally valid.
    #[error("spec parse error ({format}): {message}")]
    SpecParse {
        format: DocumentFormat,
        message: String,
    },

    #[error("unsupported specification dialect: {0}")]
    UnsupportedDialect(String),

    #[error("failed to read specification: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a reference could not be followed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReferenceError {
    #[error("unresolved reference '{0}'")]
    Unresolved(String),

    #[error("cyclic reference '{0}'")]
    Cycle(String),

    #[error("reference chain longer than {0} hops")]
    TooDeep(usize),

    #[error("external reference '{0}' is not supported")]
    External(String),
}

/// Kind of a non-fatal import gap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    /// A unit was malformed or incomplete and skipped.
    PartialImport,
    /// A reference could not be dereferenced; the example was skipped.
    ReferenceResolution,
}

/// A skipped unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportWarning {
    pub kind: WarningKind,
    /// Path of the unit within the document, e.g. `SUBSCRIBE user/signedup#laurent`.
    pub unit: String,
    pub reason: String,
}

impl std::fmt::Display for ImportWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.unit, self.reason)
    }
}

/// Services produced by an import plus everything that was skipped.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImportOutcome {
    pub services: Vec<Service>,
    pub warnings: Vec<ImportWarning>,
}

/// Collects warnings during one import.
#[derive(Debug, Default)]
pub(crate) struct Warnings {
    items: Vec<ImportWarning>,
}

impl Warnings {
    pub(crate) fn partial(&mut self, unit: impl Into<String>, reason: impl Into<String>) {
        self.push(WarningKind::PartialImport, unit.into(), reason.into());
    }

    pub(crate) fn reference(&mut self, unit: impl Into<String>, error: &ReferenceError) {
        self.push(WarningKind::ReferenceResolution, unit.into(), error.to_string());
    }

    fn push(&mut self, kind: WarningKind, unit: String, reason: String) {
        warn!(unit = %unit, reason = %reason, ?kind, "Skipping unit during import");
        self.items.push(ImportWarning { kind, unit, reason });
    }

    pub(crate) fn into_vec(self) -> Vec<ImportWarning> {
        self.items
    }
}

/// Supported specification dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    AsyncApi,
    OpenApi,
}

impl Dialect {
    /// Root key whose presence identifies a document of this dialect.
    pub fn root_key(self) -> &'static str {
        match self {
            Dialect::AsyncApi => "asyncapi",
            Dialect::OpenApi => "openapi",
        }
    }
}

/// A dialect-specific importer.
pub trait SpecImporter: Send + Sync {
    fn dialect(&self) -> Dialect;

    fn settings(&self) -> &ImporterSettings;

    /// Import an already parsed document tree.
    fn import_tree(&self, spec: &Value) -> Result<ImportOutcome, ImportError>;

    /// Parse raw bytes and import them.
    fn import(
        &self,
        content: &[u8],
        declared: Option<DocumentFormat>,
    ) -> Result<ImportOutcome, ImportError> {
        let spec = parse_document(content, declared, self.settings())?;
        self.import_tree(&spec)
    }
}

/// Sniff, parse and import a document of any supported dialect.
pub fn import_document(
    content: &[u8],
    declared: Option<DocumentFormat>,
    settings: &ImporterSettings,
) -> Result<ImportOutcome, ImportError> {
    let spec = parse_document(content, declared, settings)?;

    let importers: [Box<dyn SpecImporter>; 2] = [
        Box::new(AsyncApiImporter::new(settings.clone())),
        Box::new(OpenApiImporter::new(settings.clone())),
    ];
    let Some(importer) = importers.iter().find(|i| spec.has(i.dialect().root_key())) else {
        let root_keys: Vec<&str> = spec.fields().map(|(k, _)| k.as_str()).take(3).collect();
        return Err(ImportError::UnsupportedDialect(format!(
            "no 'asyncapi' or 'openapi' root key (found: {})",
            root_keys.join(", ")
        )));
    };
    debug!(dialect = ?importer.dialect(), "Dialect detected");
    let outcome = importer.import_tree(&spec)?;

    info!(
        services = outcome.services.len(),
        warnings = outcome.warnings.len(),
        "Specification imported"
    );
    Ok(outcome)
}

/// Guess the structural format from the first non-blank lines.
///
/// Lines starting with `{` or `[` mean JSON; `---` or a dialect root key
/// means YAML. Falls back to `fallback` when nothing conclusive shows up
/// within `max_lines` non-blank lines.
pub fn sniff_format(content: &[u8], max_lines: usize, fallback: DocumentFormat) -> DocumentFormat {
    let text = String::from_utf8_lossy(content);
    for line in text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .take(max_lines)
    {
        if line.starts_with('{') || line.starts_with('[') {
            return DocumentFormat::Json;
        }
        if line.starts_with("---")
            || line.starts_with("asyncapi:")
            || line.starts_with("openapi:")
            || line.starts_with("swagger:")
        {
            return DocumentFormat::Yaml;
        }
    }
    fallback
}

/// Parse raw bytes into a generic tree.
pub fn parse_document(
    content: &[u8],
    declared: Option<DocumentFormat>,
    settings: &ImporterSettings,
) -> Result<Value, ImportError> {
    let fallback = declared.unwrap_or(settings.default_format);
    let format = sniff_format(content, settings.sniff_lines, fallback);

    let spec: Value = match format {
        DocumentFormat::Json => serde_json::from_slice(content).map_err(|e| ImportError::SpecParse {
            format,
            message: e.to_string(),
        })?,
        DocumentFormat::Yaml => serde_yaml::from_slice(content).map_err(|e| ImportError::SpecParse {
            format,
            message: e.to_string(),
        })?,
    };

    if !spec.is_object() {
        return Err(ImportError::SpecParse {
            format,
            message: "document root is not an object".to_string(),
        });
    }
    Ok(spec)
}

static NULL: Value = Value::Null;

/// Default-returning accessors over a document tree.
pub trait NodeExt {
    /// Child `key`, or a null node when absent.
    fn path(&self, key: &str) -> &Value;

    fn has(&self, key: &str) -> bool;

    /// Scalar rendered as text; structures rendered as compact JSON; null as "".
    fn as_text(&self) -> String;

    /// Object entries, empty for anything else.
    fn fields(&self) -> std::iter::Flatten<std::option::IntoIter<&serde_json::Map<String, Value>>>;

    /// Array elements, empty for anything else.
    fn elements(&self) -> std::iter::Flatten<std::option::IntoIter<&Vec<Value>>>;
}

impl NodeExt for Value {
    fn path(&self, key: &str) -> &Value {
        self.get(key).unwrap_or(&NULL)
    }

    fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    fn as_text(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::String(s) => s.clone(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            other => other.to_string(),
        }
    }

    fn fields(&self) -> std::iter::Flatten<std::option::IntoIter<&serde_json::Map<String, Value>>> {
        self.as_object().into_iter().flatten()
    }

    fn elements(&self) -> std::iter::Flatten<std::option::IntoIter<&Vec<Value>>> {
        self.as_array().into_iter().flatten()
    }
}

/// Follows local JSON-pointer references (`#/components/...`) with a hop
/// limit and cycle detection.
pub struct ReferenceResolver<'a> {
    root: &'a Value,
    max_depth: usize,
}

impl<'a> ReferenceResolver<'a> {
    pub fn new(root: &'a Value, max_depth: usize) -> Self {
        Self { root, max_depth }
    }

    /// Follow `ref_key` pointers from `node` until reaching a node without one.
    pub fn resolve(&self, node: &'a Value, ref_key: &str) -> Result<&'a Value, ReferenceError> {
        let mut current = node;
        let mut seen: HashSet<&str> = HashSet::new();

        while let Some(pointer) = current.get(ref_key).and_then(Value::as_str) {
            if !seen.insert(pointer) {
                return Err(ReferenceError::Cycle(pointer.to_string()));
            }
            if seen.len() > self.max_depth {
                return Err(ReferenceError::TooDeep(self.max_depth));
            }
            current = self.lookup(pointer)?;
        }
        Ok(current)
    }

    /// Dereference a single pointer.
    pub fn lookup(&self, pointer: &str) -> Result<&'a Value, ReferenceError> {
        let local = pointer
            .strip_prefix('#')
            .ok_or_else(|| ReferenceError::External(pointer.to_string()))?;
        self.root
            .pointer(local)
            .ok_or_else(|| ReferenceError::Unresolved(pointer.to_string()))
    }
}

/// Text form of an example payload: structures serialized verbatim, scalars as text.
pub(crate) fn payload_text(payload: &Value) -> String {
    match payload {
        Value::Object(_) | Value::Array(_) => payload.to_string(),
        other => other.as_text(),
    }
}
