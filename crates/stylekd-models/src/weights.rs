//! Named-weight transfer between networks and safetensors files.
//!
//! Parameters are addressed by their flattened `ModuleParameters` path
//! (`convs.3.conv.weight`). Checkpoints namespace several networks in one
//! file with a prefix such as `g.` or `g_ema.`.

use std::collections::HashMap;
use std::path::Path;

use mlx_rs::{module::ModuleParameters, Array};

use crate::error::{ModelError, Result};

/// Copy every parameter of `model` into a name-keyed map, prefixed.
pub fn named_weights<M: ModuleParameters>(model: &M, prefix: &str) -> HashMap<String, Array> {
    model
        .parameters()
        .flatten()
        .into_iter()
        .map(|(key, value)| (format!("{prefix}{key}"), value.clone()))
        .collect()
}

/// Outcome of a weight transfer.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadReport {
    /// Parameters overwritten.
    pub loaded: Vec<String>,
    /// Parameters with no source weight.
    pub missing: Vec<String>,
    /// Parameters whose source weight had a different shape.
    pub mismatched: Vec<String>,
}

/// Overwrite parameters of `model` from `weights[prefix + name]`.
///
/// In strict mode any missing or mis-shaped weight is an error and nothing
/// is written; otherwise they are skipped and listed in the report.
pub fn load_weights<M: ModuleParameters>(
    model: &mut M,
    weights: &HashMap<String, Array>,
    prefix: &str,
    strict: bool,
) -> Result<LoadReport> {
    load_filtered(model, weights, prefix, strict, |_| true)
}

fn load_filtered<M, F>(
    model: &mut M,
    weights: &HashMap<String, Array>,
    prefix: &str,
    strict: bool,
    keep: F,
) -> Result<LoadReport>
where
    M: ModuleParameters,
    F: Fn(&str) -> bool,
{
    let mut report = LoadReport::default();
    let mut updates = Vec::new();

    for (key, param) in model.parameters().flatten() {
        if !keep(&key) {
            continue;
        }
        let source_key = format!("{prefix}{key}");
        match weights.get(&source_key) {
            None => {
                if strict {
                    return Err(ModelError::MissingWeight(source_key));
                }
                report.missing.push(key.to_string());
            }
            Some(source) if source.shape() != param.shape() => {
                if strict {
                    return Err(ModelError::ShapeMismatch {
                        key: source_key,
                        expected: param.shape().to_vec(),
                        actual: source.shape().to_vec(),
                    });
                }
                report.mismatched.push(key.to_string());
            }
            Some(source) => updates.push((key.to_string(), source.clone())),
        }
    }

    let mut params = model.parameters_mut().flatten();
    for (key, value) in updates {
        if let Some(param) = params.get_mut(key.as_str()) {
            **param = value;
            report.loaded.push(key);
        }
    }

    report.loaded.sort();
    report.missing.sort();
    report.mismatched.sort();
    Ok(report)
}

/// Selects the style-mapping parameters of a generator.
///
/// The selection is a plain substring test on the flattened parameter name;
/// `version` identifies the rule so checkpoints can record which one was used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StyleKeyFilter {
    /// Substring a parameter name must contain.
    pub marker: &'static str,
    /// Rule version.
    pub version: u32,
}

impl StyleKeyFilter {
    /// Names containing `style`.
    pub const V1: Self = Self {
        marker: "style",
        version: 1,
    };

    /// Whether `key` belongs to the style network.
    pub fn matches(&self, key: &str) -> bool {
        key.contains(self.marker)
    }
}

impl Default for StyleKeyFilter {
    fn default() -> Self {
        Self::V1
    }
}

/// Copy the teacher's style-mapping weights into `student`, non-strictly.
///
/// Only parameters selected by `filter` are touched; names absent from the
/// teacher or with a different shape are skipped.
pub fn inherit_style<M: ModuleParameters>(
    student: &mut M,
    teacher_weights: &HashMap<String, Array>,
    prefix: &str,
    filter: StyleKeyFilter,
) -> Result<LoadReport> {
    let report = load_filtered(student, teacher_weights, prefix, false, |k| filter.matches(k))?;
    tracing::info!(
        prefix,
        filter_version = filter.version,
        loaded = report.loaded.len(),
        skipped = report.missing.len() + report.mismatched.len(),
        "inherited style network"
    );
    Ok(report)
}

/// Read every array of a safetensors file.
pub fn read_safetensors(path: impl AsRef<Path>) -> Result<HashMap<String, Array>> {
    Ok(Array::load_safetensors(path.as_ref())?)
}

/// Write a name-keyed map to a safetensors file.
pub fn write_safetensors(weights: HashMap<String, Array>, path: impl AsRef<Path>) -> Result<()> {
    Array::save_safetensors(weights, None, path.as_ref())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{GeneratorConfig, StyleGenerator};
    use serial_test::serial;

    fn tiny(cm: usize) -> StyleGenerator {
        StyleGenerator::new(GeneratorConfig::new(8, 4, 2, cm, 8)).unwrap()
    }

    fn max_abs_diff(a: &Array, b: &Array) -> f32 {
        a.subtract(b).unwrap().abs().unwrap().max(None).unwrap().item::<f32>()
    }

    #[test]
    #[serial]
    fn test_strict_round_trip() {
        crate::seed_tensor_rng(11).unwrap();
        let src = tiny(1);
        let mut dst = tiny(1);
        let weights = named_weights(&src, "g.");
        let report = load_weights(&mut dst, &weights, "g.", true).unwrap();
        assert!(report.missing.is_empty());
        let a = src.const_input.as_ref();
        let b = dst.const_input.as_ref();
        assert!(max_abs_diff(a, b) < 1e-7);
    }

    #[test]
    #[serial]
    fn test_strict_rejects_missing() {
        crate::seed_tensor_rng(12).unwrap();
        let mut dst = tiny(1);
        let err = load_weights(&mut dst, &HashMap::new(), "g.", true).unwrap_err();
        assert!(matches!(err, ModelError::MissingWeight(_)));
    }

    #[test]
    #[serial]
    fn test_inherit_style_touches_only_mapping() {
        crate::seed_tensor_rng(13).unwrap();
        // Different widths: synthesis shapes differ, mapping shapes agree.
        let teacher = StyleGenerator::new(GeneratorConfig::new(8, 4, 2, 2, 16)).unwrap();
        let mut student = tiny(1);
        let before = student.const_input.as_ref().clone();

        let weights = named_weights(&teacher, "g.");
        let report = inherit_style(&mut student, &weights, "g.", StyleKeyFilter::V1).unwrap();

        assert_eq!(report.loaded.len(), 4);
        assert!(report.loaded.iter().all(|k| k.starts_with("style.")));
        assert!(max_abs_diff(&student.style[0].weight, &teacher.style[0].weight) < 1e-7);
        assert!(max_abs_diff(student.const_input.as_ref(), &before) < 1e-7);
    }

    #[test]
    #[serial]
    fn test_safetensors_file_round_trip() {
        crate::seed_tensor_rng(14).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("g.safetensors");
        let src = tiny(1);
        write_safetensors(named_weights(&src, ""), &path).unwrap();
        let loaded = read_safetensors(&path).unwrap();
        let mut dst = tiny(1);
        load_weights(&mut dst, &loaded, "", true).unwrap();
        assert!(max_abs_diff(&src.to_rgb1.bias, &dst.to_rgb1.bias) < 1e-7);
    }

    #[test]
    fn test_filter_matches() {
        let f = StyleKeyFilter::default();
        assert!(f.matches("style.3.weight"));
        assert!(!f.matches("convs.0.conv.modulation.weight"));
    }
}
