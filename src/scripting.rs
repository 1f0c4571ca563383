//! The "typed callable" script contract (§9 design note).
//!
//! The reference implementation embeds a Go interpreter (yaegi) so user
//! scripts can run inside the worker process. That is a language-specific
//! crutch, not a requirement of the system: the design note is explicit
//! that "implementations may use a sandboxed embedded interpreter or a
//! precompiled plugin." This crate takes the precompiled-plugin branch —
//! a response checker or dynamic-param generator is a `Send + Sync`
//! trait object, constructed once at `Peck` time and dry-run once at
//! admission (§4.1). No scripting-language runtime is linked into this
//! crate (§12).

use serde_json::Value;

/// Per-request response-body classifier. Invoked once per response with
/// the body as a string; returns a short tag folded into
/// `Aggregate.body_check_result_map`.
pub trait ResponseChecker: Send + Sync {
    fn check(&self, body: &str) -> String;
}

/// Produces the list of `{headers, query, body}` variants a task's
/// per-request execution picks from uniformly at random (§4.2).
pub trait ParamGenerator: Send + Sync {
    fn generate(&self) -> Result<Vec<ParamVariant>, String>;
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ParamVariant {
    #[serde(default)]
    pub headers: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub query: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
}

/// The crate's built-in default `ResponseChecker`: tags a response "ok" if
/// its body equals a literal string verbatim, "mismatch" otherwise. This is
/// deliberately the simplest possible implementation of the contract, not a
/// general expression language — §12 rules out shipping one.
pub struct LiteralEqualityChecker {
    expected: String,
}

impl LiteralEqualityChecker {
    pub fn new(expected: impl Into<String>) -> Self {
        Self {
            expected: expected.into(),
        }
    }
}

impl ResponseChecker for LiteralEqualityChecker {
    fn check(&self, body: &str) -> String {
        if body == self.expected {
            "ok".to_string()
        } else {
            "mismatch".to_string()
        }
    }
}

/// Wraps a plain closure as a `ResponseChecker`, the direct implementation
/// of the "typed callable" contract for callers that don't need a whole
/// embedded interpreter.
pub struct FnResponseChecker<F>(pub F)
where
    F: Fn(&str) -> String + Send + Sync;

impl<F> ResponseChecker for FnResponseChecker<F>
where
    F: Fn(&str) -> String + Send + Sync,
{
    fn check(&self, body: &str) -> String {
        (self.0)(body)
    }
}

/// Wraps a plain closure as a `ParamGenerator`.
pub struct FnParamGenerator<F>(pub F)
where
    F: Fn() -> Result<Vec<ParamVariant>, String> + Send + Sync;

impl<F> ParamGenerator for FnParamGenerator<F>
where
    F: Fn() -> Result<Vec<ParamVariant>, String> + Send + Sync,
{
    fn generate(&self) -> Result<Vec<ParamVariant>, String> {
        (self.0)()
    }
}

/// A `ParamGenerator` backed by a fixed JSON array, the shape a `Peck` RPC
/// actually carries on the wire (`dynamic_params: repeated bytes`, each a
/// pre-rendered JSON variant) — the controller dry-runs the user's script
/// once at admission and hands the worker the rendered variants, not the
/// script source, so the worker never needs to execute anything itself.
pub struct StaticParamGenerator {
    variants: Vec<ParamVariant>,
}

impl StaticParamGenerator {
    pub fn from_json_variants(raw: &[Vec<u8>]) -> Result<Self, String> {
        let variants = raw
            .iter()
            .map(|bytes| {
                serde_json::from_slice(bytes).map_err(|e| format!("invalid variant JSON: {e}"))
            })
            .collect::<Result<Vec<ParamVariant>, String>>()?;
        Ok(Self { variants })
    }
}

impl ParamGenerator for StaticParamGenerator {
    fn generate(&self) -> Result<Vec<ParamVariant>, String> {
        Ok(self.variants.clone())
    }
}

/// Runs the admission-time dry-run required by §4.1: the response-check
/// callable is invoked once on an empty string, the dynamic-param callable
/// is invoked once with its output treated as a list of variants. Either
/// callable failing (including a generator returning zero variants or a
/// single variant whose serialized form exceeds the configured byte limit)
/// fails the dry-run.
pub fn dry_run(
    checker: Option<&dyn ResponseChecker>,
    generator: Option<&dyn ParamGenerator>,
    max_param_bytes: usize,
) -> Result<(), String> {
    if let Some(checker) = checker {
        // Invoking this must not panic; a checker that panics on valid
        // UTF-8 input is itself a dry-run failure.
        let _ = checker.check("");
    }
    if let Some(generator) = generator {
        let variants = generator.generate()?;
        for variant in &variants {
            let encoded =
                serde_json::to_vec(variant).map_err(|e| format!("variant not serializable: {e}"))?;
            if encoded.len() > max_param_bytes {
                return Err(format!(
                    "dynamic-param variant is {} bytes, exceeds limit {}",
                    encoded.len(),
                    max_param_bytes
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_equality_checker_tags_match_and_mismatch() {
        let checker = LiteralEqualityChecker::new("pong");
        assert_eq!(checker.check("pong"), "ok");
        assert_eq!(checker.check("ping"), "mismatch");
    }

    #[test]
    fn dry_run_passes_for_well_behaved_callables() {
        let checker = LiteralEqualityChecker::new("ok");
        let generator = FnParamGenerator(|| Ok(vec![ParamVariant::default()]));
        assert!(dry_run(Some(&checker), Some(&generator), 100_000).is_ok());
    }

    #[test]
    fn dry_run_fails_when_generator_errors() {
        let failing = FnParamGenerator(|| Err::<Vec<ParamVariant>, _>("boom".to_string()));
        assert!(dry_run(None, Some(&failing), 100_000).is_err());
    }

    #[test]
    fn dry_run_rejects_oversized_variant() {
        let mut variant = ParamVariant::default();
        variant.body = Some(serde_json::Value::String("x".repeat(200)));
        let generator = FnParamGenerator(move || Ok(vec![variant.clone()]));
        assert!(dry_run(None, Some(&generator), 50).is_err());
    }

    #[test]
    fn static_param_generator_parses_wire_variants() {
        let raw = vec![serde_json::to_vec(&ParamVariant {
            headers: Default::default(),
            query: Default::default(),
            body: Some(serde_json::json!({"a": 1})),
        })
        .unwrap()];
        let gen = StaticParamGenerator::from_json_variants(&raw).unwrap();
        let variants = gen.generate().unwrap();
        assert_eq!(variants.len(), 1);
    }
}
