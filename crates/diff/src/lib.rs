//! Deterministic manifest diff rendering.
//!
//! Marshals manifests to canonical YAML (lexicographic key order) and renders
//! a unified diff with stable `a/<path>`/`b/<path>` labels. Byte-identical
//! output for identical inputs is a contract relied upon by golden tests.

#![forbid(unsafe_code)]

use konverge_core::{manifest_path_with_gv, Manifest};
use similar::TextDiff;

/// Lines of context around each hunk, matching `kubectl diff` output.
const CONTEXT_RADIUS: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("serializing manifest to YAML")]
    Yaml(#[from] serde_yaml::Error),
}

/// Render a unified diff between two optional manifest snapshots.
///
/// Either side may be absent: `(None, Some)` renders a pure addition,
/// `(Some, None)` a pure deletion. Equal inputs render the empty string.
/// Secret values are passed through verbatim; redaction is the caller's
/// concern.
pub fn render_diff(before: Option<&Manifest>, after: Option<&Manifest>) -> Result<String, RenderError> {
    let mut path = String::new();
    let mut a = String::new();
    let mut b = String::new();

    if let Some(before) = before {
        path = manifest_path_with_gv(before);
        a = canonical_yaml(before)?;
    }
    if let Some(after) = after {
        path = manifest_path_with_gv(after);
        b = canonical_yaml(after)?;
    }

    Ok(TextDiff::from_lines(&a, &b)
        .unified_diff()
        .context_radius(CONTEXT_RADIUS)
        .header(&format!("a/{path}"), &format!("b/{path}"))
        .to_string())
}

/// Serialize a manifest to YAML with all object keys in lexicographic order.
///
/// Key order must not depend on the producer of the value, so the tree is
/// re-built into sorted maps before serialization.
pub fn canonical_yaml(manifest: &Manifest) -> Result<String, RenderError> {
    Ok(serde_yaml::to_string(&canonicalize(manifest))?)
}

fn canonicalize(value: &Manifest) -> Manifest {
    match value {
        Manifest::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = serde_json::Map::new();
            for k in keys {
                out.insert(k.clone(), canonicalize(&map[k]));
            }
            Manifest::Object(out)
        }
        Manifest::Array(items) => Manifest::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}
