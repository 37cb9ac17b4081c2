//! `${{ ... }}` expression interpolation and secret masking.

use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Replacement text for masked secret values.
pub const MASK: &str = "***";

fn expression_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{\{\s*([^}]+?)\s*\}\}").expect("valid interpolation regex")
    })
}

/// Values visible to expressions inside step commands, inputs and env.
#[derive(Debug, Clone, Default)]
pub struct InterpolationContext {
    /// Merged environment: `env.NAME`
    pub env: BTreeMap<String, String>,
    /// Step outputs keyed by step id: `steps.<id>.outputs.<key>`
    pub outputs: BTreeMap<String, BTreeMap<String, String>>,
    /// Secrets: `secrets.NAME`, also masked in output
    pub secrets: BTreeMap<String, String>,
}

impl InterpolationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_secrets(mut self, secrets: BTreeMap<String, String>) -> Self {
        self.secrets = secrets;
        self
    }

    pub fn set_outputs(&mut self, step_id: &str, outputs: BTreeMap<String, String>) {
        self.outputs.insert(step_id.to_string(), outputs);
    }

    /// Replace every `${{ expr }}` in `input`. Unknown expressions expand
    /// to the empty string.
    pub fn interpolate(&self, input: &str) -> String {
        if !input.contains("${{") {
            return input.to_string();
        }
        expression_pattern()
            .replace_all(input, |caps: &Captures| {
                let expr = caps.get(1).map_or("", |m| m.as_str()).trim();
                self.resolve(expr)
            })
            .into_owned()
    }

    pub fn interpolate_map(&self, map: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        map.iter()
            .map(|(k, v)| (k.clone(), self.interpolate(v)))
            .collect()
    }

    fn resolve(&self, expr: &str) -> String {
        if let Some(name) = expr.strip_prefix("env.") {
            return self.env.get(name).cloned().unwrap_or_default();
        }
        if let Some(name) = expr.strip_prefix("secrets.") {
            return self.secrets.get(name).cloned().unwrap_or_default();
        }
        if let Some(rest) = expr.strip_prefix("steps.")
            && let Some((step_id, key)) = rest.split_once(".outputs.")
        {
            return self
                .outputs
                .get(step_id)
                .and_then(|o| o.get(key))
                .cloned()
                .unwrap_or_default();
        }
        String::new()
    }

    /// Replace every non-empty secret value in `input` with `***`.
    pub fn mask_secrets(&self, input: &str) -> String {
        mask(input, self.secrets.values().map(String::as_str))
    }
}

/// Replace each of `secrets` in `input` with `***`, longest first so that
/// a secret containing another is masked whole.
pub fn mask<'a>(input: &str, secrets: impl IntoIterator<Item = &'a str>) -> String {
    let mut values: Vec<&str> = secrets.into_iter().filter(|s| !s.is_empty()).collect();
    values.sort_by_key(|s| std::cmp::Reverse(s.len()));
    let mut output = input.to_string();
    for value in values {
        if output.contains(value) {
            output = output.replace(value, MASK);
        }
    }
    output
}
