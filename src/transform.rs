//! Transform steps: the units a file's patch chain is built from.
//!
//! Every step maps a byte buffer to a new byte buffer and fails instead of
//! guessing when the content does not look the way the step expects.

use crate::replace::{find_all, preview, splice_at, text_bytes, ReplaceError, ReplacementSpec};
use crate::session::FailureKind;
use regex::bytes::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    #[error(transparent)]
    Replace(#[from] ReplaceError),

    #[error("anchor {anchor:?} not found")]
    AnchorNotFound { anchor: String },

    #[error("invalid regex {pattern:?}: {message}")]
    InvalidRegex { pattern: String, message: String },

    #[error("invalid JSON document: {0}")]
    Json(String),

    #[error("step cannot run: {0}")]
    Unsupported(String),

    #[error("{step}: {message}")]
    Custom { step: String, message: String },
}

impl TransformError {
    pub fn kind(&self) -> FailureKind {
        match self {
            TransformError::Replace(ReplaceError::CountMismatch { .. }) => {
                FailureKind::ReplacementCountMismatch
            }
            TransformError::Replace(ReplaceError::EmptyPattern)
            | TransformError::InvalidRegex { .. }
            | TransformError::Unsupported(_) => FailureKind::Configuration,
            TransformError::AnchorNotFound { .. } => FailureKind::AnchorNotFound,
            TransformError::Json(_) | TransformError::Custom { .. } => FailureKind::Transform,
        }
    }
}

/// Where inserted text goes relative to its anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Position {
    #[default]
    Before,
    After,
    /// Only meaningful for [`Injection`]: the match itself is replaced.
    Replace,
}

/// Insert a fixed block next to every occurrence of an anchor.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Insertion {
    #[serde(deserialize_with = "text_bytes")]
    pub anchor: Vec<u8>,
    #[serde(deserialize_with = "text_bytes")]
    pub text: Vec<u8>,
    #[serde(default)]
    pub position: Position,
    #[serde(default = "one")]
    pub count: usize,
}

/// Extract values with a regex at the target site and insert a template
/// expanded from its captures (`$1`, `${name}`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Injection {
    pub pattern: String,
    pub template: String,
    #[serde(default)]
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum JsonEdit {
    /// Overwrite the existing value at a JSON pointer.
    Set { pointer: String, value: Value },
    /// Append to the array at a JSON pointer.
    Push { pointer: String, value: Value },
}

pub type StepFn = dyn Fn(&[u8]) -> Result<Vec<u8>, TransformError> + Send + Sync;

/// A transform registered from Rust code.
#[derive(Clone)]
pub struct CustomStep {
    pub name: String,
    func: Arc<StepFn>,
}

impl fmt::Debug for CustomStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomStep").field("name", &self.name).finish()
    }
}

fn one() -> usize {
    1
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Step {
    Replace(ReplacementSpec),
    Prepend {
        #[serde(deserialize_with = "text_bytes")]
        text: Vec<u8>,
    },
    Append {
        #[serde(deserialize_with = "text_bytes")]
        text: Vec<u8>,
    },
    Insert(Insertion),
    Inject(Injection),
    Json {
        edits: Vec<JsonEdit>,
    },
    #[serde(skip)]
    Custom(CustomStep),
}

impl Step {
    pub fn replace(old: impl Into<Vec<u8>>, new: impl Into<Vec<u8>>, count: usize) -> Self {
        Step::Replace(ReplacementSpec::new(old, new, count))
    }

    pub fn prepend(text: impl Into<Vec<u8>>) -> Self {
        Step::Prepend { text: text.into() }
    }

    pub fn append(text: impl Into<Vec<u8>>) -> Self {
        Step::Append { text: text.into() }
    }

    pub fn insert(
        anchor: impl Into<Vec<u8>>,
        text: impl Into<Vec<u8>>,
        position: Position,
    ) -> Self {
        Step::Insert(Insertion {
            anchor: anchor.into(),
            text: text.into(),
            position,
            count: 1,
        })
    }

    pub fn inject(
        pattern: impl Into<String>,
        template: impl Into<String>,
        position: Position,
    ) -> Self {
        Step::Inject(Injection {
            pattern: pattern.into(),
            template: template.into(),
            position,
        })
    }

    pub fn json(edits: Vec<JsonEdit>) -> Self {
        Step::Json { edits }
    }

    pub fn custom<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&[u8]) -> Result<Vec<u8>, TransformError> + Send + Sync + 'static,
    {
        Step::Custom(CustomStep {
            name: name.into(),
            func: Arc::new(func),
        })
    }

    /// Short human-readable label used in logs and reports.
    pub fn describe(&self) -> String {
        match self {
            Step::Replace(spec) => format!("replace {:?} x{}", preview(&spec.old), spec.count),
            Step::Prepend { text } => format!("prepend {} bytes", text.len()),
            Step::Append { text } => format!("append {} bytes", text.len()),
            Step::Insert(ins) => format!(
                "insert {:?} {:?} x{}",
                ins.position,
                preview(&ins.anchor),
                ins.count
            ),
            Step::Inject(inj) => format!("inject {:?} /{}/", inj.position, inj.pattern),
            Step::Json { edits } => format!("json ({} edits)", edits.len()),
            Step::Custom(custom) => format!("custom {}", custom.name),
        }
    }

    /// Configuration problems detectable without any file content.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Step::Replace(spec) => spec.validate(),
            Step::Prepend { text } | Step::Append { text } => {
                if text.is_empty() {
                    Err("prepend/append text is empty".to_string())
                } else {
                    Ok(())
                }
            }
            Step::Insert(ins) => {
                if ins.anchor.is_empty() {
                    return Err("insert anchor is empty".to_string());
                }
                if ins.count == 0 {
                    return Err(format!(
                        "insert at {:?} has count 0",
                        preview(&ins.anchor)
                    ));
                }
                if ins.position == Position::Replace {
                    return Err("insert only supports position before/after".to_string());
                }
                Ok(())
            }
            Step::Inject(inj) => compile(&inj.pattern).map(|_| ()).map_err(|e| e.to_string()),
            Step::Json { edits } => {
                if edits.is_empty() {
                    return Err("json step has no edits".to_string());
                }
                for edit in edits {
                    let pointer = edit.pointer();
                    if !pointer.is_empty() && !pointer.starts_with('/') {
                        return Err(format!("json pointer {pointer:?} must start with '/'"));
                    }
                }
                Ok(())
            }
            Step::Custom(_) => Ok(()),
        }
    }

    pub fn apply(&self, input: &[u8]) -> Result<Vec<u8>, TransformError> {
        match self {
            Step::Replace(spec) => Ok(spec.apply(input)?),
            Step::Prepend { text } => {
                let mut out = Vec::with_capacity(text.len() + input.len());
                out.extend_from_slice(text);
                out.extend_from_slice(input);
                Ok(out)
            }
            Step::Append { text } => {
                let mut out = Vec::with_capacity(input.len() + text.len());
                out.extend_from_slice(input);
                out.extend_from_slice(text);
                Ok(out)
            }
            Step::Insert(ins) => insert(input, ins),
            Step::Inject(inj) => inject(input, inj),
            Step::Json { edits } => edit_json(input, edits),
            Step::Custom(custom) => (custom.func)(input),
        }
    }
}

impl JsonEdit {
    pub fn pointer(&self) -> &str {
        match self {
            JsonEdit::Set { pointer, .. } | JsonEdit::Push { pointer, .. } => pointer,
        }
    }
}

fn insert(input: &[u8], ins: &Insertion) -> Result<Vec<u8>, TransformError> {
    if ins.anchor.is_empty() {
        return Err(ReplaceError::EmptyPattern.into());
    }
    let positions = find_all(input, &ins.anchor);
    check_anchor_count(&ins.anchor, ins.count, positions.len())?;

    let mut block = Vec::with_capacity(ins.anchor.len() + ins.text.len());
    match ins.position {
        Position::After => {
            block.extend_from_slice(&ins.anchor);
            block.extend_from_slice(&ins.text);
        }
        Position::Before => {
            block.extend_from_slice(&ins.text);
            block.extend_from_slice(&ins.anchor);
        }
        Position::Replace => {
            return Err(TransformError::Unsupported(
                "insert only supports position before/after".to_string(),
            ))
        }
    }
    Ok(splice_at(input, &positions, ins.anchor.len(), &block))
}

fn inject(input: &[u8], inj: &Injection) -> Result<Vec<u8>, TransformError> {
    let re = compile(&inj.pattern)?;

    let matches = re.find_iter(input).count();
    check_anchor_count(inj.pattern.as_bytes(), 1, matches)?;

    // Exactly one match exists, so captures() cannot miss.
    let Some(caps) = re.captures(input) else {
        return Err(TransformError::AnchorNotFound {
            anchor: inj.pattern.clone(),
        });
    };
    let whole = caps.get(0).map(|m| m.range()).unwrap_or(0..0);

    let mut expanded = Vec::new();
    caps.expand(inj.template.as_bytes(), &mut expanded);

    let mut out = Vec::with_capacity(input.len() + expanded.len());
    match inj.position {
        Position::Before => {
            out.extend_from_slice(&input[..whole.start]);
            out.extend_from_slice(&expanded);
            out.extend_from_slice(&input[whole.start..]);
        }
        Position::After => {
            out.extend_from_slice(&input[..whole.end]);
            out.extend_from_slice(&expanded);
            out.extend_from_slice(&input[whole.end..]);
        }
        Position::Replace => {
            out.extend_from_slice(&input[..whole.start]);
            out.extend_from_slice(&expanded);
            out.extend_from_slice(&input[whole.end..]);
        }
    }
    Ok(out)
}

fn edit_json(input: &[u8], edits: &[JsonEdit]) -> Result<Vec<u8>, TransformError> {
    let mut doc: Value =
        serde_json::from_slice(input).map_err(|e| TransformError::Json(e.to_string()))?;

    for edit in edits {
        let missing = || TransformError::AnchorNotFound {
            anchor: edit.pointer().to_string(),
        };
        match edit {
            JsonEdit::Set { pointer, value } => {
                let target = doc.pointer_mut(pointer).ok_or_else(missing)?;
                *target = value.clone();
            }
            JsonEdit::Push { pointer, value } => {
                let target = doc
                    .pointer_mut(pointer)
                    .and_then(Value::as_array_mut)
                    .ok_or_else(missing)?;
                target.push(value.clone());
            }
        }
    }

    serde_json::to_vec_pretty(&doc).map_err(|e| TransformError::Json(e.to_string()))
}

fn compile(pattern: &str) -> Result<Regex, TransformError> {
    Regex::new(pattern).map_err(|e| TransformError::InvalidRegex {
        pattern: pattern.to_string(),
        message: e.to_string(),
    })
}

/// Zero hits on an anchor that must exist is a missing anchor; any other
/// mismatch is a count contract violation.
fn check_anchor_count(anchor: &[u8], expected: usize, actual: usize) -> Result<(), TransformError> {
    if actual == expected {
        return Ok(());
    }
    if actual == 0 {
        return Err(TransformError::AnchorNotFound {
            anchor: preview(anchor),
        });
    }
    Err(ReplaceError::CountMismatch {
        pattern: preview(anchor),
        expected,
        actual,
    }
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_prepend_and_append() {
        let out = Step::prepend("const A=1;\n").apply(b"body();").unwrap();
        assert_eq!(out, b"const A=1;\nbody();");

        let out = Step::append("\n//end").apply(b"body();").unwrap();
        assert_eq!(out, b"body();\n//end");
    }

    #[test]
    fn test_insert_before_anchor() {
        let step = Step::insert("constructor(u){", "/*patched*/", Position::Before);
        let out = step.apply(b"class A{constructor(u){}}").unwrap();
        assert_eq!(out, b"class A{/*patched*/constructor(u){}}");
    }

    #[test]
    fn test_insert_after_anchor() {
        let step = Step::insert("constructor(u){", "this.x=1;", Position::After);
        let out = step.apply(b"class A{constructor(u){}}").unwrap();
        assert_eq!(out, b"class A{constructor(u){this.x=1;}}");
    }

    #[test]
    fn test_insert_missing_anchor() {
        let step = Step::insert("constructor(u){", "this.x=1;", Position::After);
        let err = step.apply(b"class A{}").unwrap_err();
        assert_eq!(
            err,
            TransformError::AnchorNotFound {
                anchor: "constructor(u){".to_string()
            }
        );
    }

    #[test]
    fn test_insert_ambiguous_anchor() {
        let step = Step::insert("f(", "g(),", Position::Before);
        let err = step.apply(b"f(1);f(2);").unwrap_err();
        assert!(matches!(
            err,
            TransformError::Replace(ReplaceError::CountMismatch {
                expected: 1,
                actual: 2,
                ..
            })
        ));
    }

    #[test]
    fn test_inject_expands_captures() {
        let step = Step::inject(
            r"universe=(\d+)-(\w+);",
            "\nconst NUM=$1;const LANG=\"$2\";",
            Position::After,
        );
        let out = step.apply(b"let universe=42-en;run();").unwrap();
        assert_eq!(
            out,
            b"let universe=42-en;\nconst NUM=42;const LANG=\"en\";run();".as_slice()
        );
    }

    #[test]
    fn test_inject_replace_match() {
        let step = Step::inject(r"host\.split\((?P<sep>.)\)", "split_host(${sep})", Position::Replace);
        let out = step.apply(b"x=host.split(.);").unwrap();
        assert_eq!(out, b"x=split_host(.);");
    }

    #[test]
    fn test_inject_without_match() {
        let step = Step::inject(r"universe=(\d+)", "$1", Position::Before);
        let err = step.apply(b"nothing here").unwrap_err();
        assert!(matches!(err, TransformError::AnchorNotFound { .. }));
    }

    #[test]
    fn test_inject_multiple_matches() {
        let step = Step::inject(r"\d+", "#", Position::Before);
        let err = step.apply(b"1 2").unwrap_err();
        assert!(matches!(
            err,
            TransformError::Replace(ReplaceError::CountMismatch { actual: 2, .. })
        ));
    }

    #[test]
    fn test_inject_invalid_regex_fails_validation() {
        let step = Step::inject(r"(unclosed", "$1", Position::Before);
        assert!(step.validate().is_err());
    }

    #[test]
    fn test_json_set_and_push() {
        let manifest = br#"{"name":"Infinity","content_scripts":[{"matches":["*://*.ogame.gameforge.com/*"]}],"host_permissions":[]}"#;
        let step = Step::json(vec![
            JsonEdit::Set {
                pointer: "/name".to_string(),
                value: json!("Infinity Ninja"),
            },
            JsonEdit::Push {
                pointer: "/content_scripts/0/matches".to_string(),
                value: json!("*://*/bots/*/browser/html/*"),
            },
            JsonEdit::Push {
                pointer: "/host_permissions".to_string(),
                value: json!("<all_urls>"),
            },
        ]);

        let out = step.apply(manifest).unwrap();
        let doc: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(doc["name"], "Infinity Ninja");
        assert_eq!(doc["content_scripts"][0]["matches"][1], "*://*/bots/*/browser/html/*");
        assert_eq!(doc["host_permissions"], json!(["<all_urls>"]));
        // Key order is preserved.
        assert!(String::from_utf8(out).unwrap().starts_with("{\n  \"name\""));
    }

    #[test]
    fn test_json_missing_pointer() {
        let step = Step::json(vec![JsonEdit::Set {
            pointer: "/action/default_title".to_string(),
            value: json!("x"),
        }]);
        let err = step.apply(br#"{"name":"a"}"#).unwrap_err();
        assert_eq!(
            err,
            TransformError::AnchorNotFound {
                anchor: "/action/default_title".to_string()
            }
        );
    }

    #[test]
    fn test_json_push_to_non_array() {
        let step = Step::json(vec![JsonEdit::Push {
            pointer: "/name".to_string(),
            value: json!("x"),
        }]);
        assert!(matches!(
            step.apply(br#"{"name":"a"}"#),
            Err(TransformError::AnchorNotFound { .. })
        ));
    }

    #[test]
    fn test_json_rejects_malformed_document() {
        let step = Step::json(vec![JsonEdit::Set {
            pointer: "/name".to_string(),
            value: json!("x"),
        }]);
        assert!(matches!(step.apply(b"{not json"), Err(TransformError::Json(_))));
    }

    #[test]
    fn test_custom_step() {
        let step = Step::custom("uppercase", |input| Ok(input.to_ascii_uppercase()));
        assert_eq!(step.apply(b"abc").unwrap(), b"ABC");
        assert_eq!(step.describe(), "custom uppercase");
    }

    #[test]
    fn test_content_failures_are_transform_kind() {
        let json_err = Step::json(vec![JsonEdit::Push {
            pointer: "/matches".to_string(),
            value: json!("*://*/*"),
        }])
        .apply(b"[1, 2")
        .unwrap_err();
        assert_eq!(json_err.kind(), FailureKind::Transform);

        let custom_err = Step::custom("minify", |_| {
            Err(TransformError::Custom {
                step: "minify".to_string(),
                message: "unterminated string literal".to_string(),
            })
        })
        .apply(b"var a = '")
        .unwrap_err();
        assert_eq!(custom_err.kind(), FailureKind::Transform);
        assert_eq!(custom_err.to_string(), "minify: unterminated string literal");

        let anchor_err = Step::insert("</head>", "<meta>", Position::Before)
            .apply(b"<body>")
            .unwrap_err();
        assert_eq!(anchor_err.kind(), FailureKind::AnchorNotFound);
    }

    #[test]
    fn test_validate_rejects_empty_anchor() {
        assert!(Step::insert("", "x", Position::Before).validate().is_err());
        assert!(Step::insert("a", "x", Position::Replace).validate().is_err());
        assert!(Step::json(Vec::new()).validate().is_err());
    }
}
