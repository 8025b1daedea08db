//! Lane variables: `name=expression` assignments and `${name}` substitution.
//!
//! Expressions are evaluated with `evalexpr` in floating point: integer literals
//! are widened to floats first, and every variable already assigned in the lane
//! is bound as a float identifier.

use crate::error::{GpibError, GpibResult};
use evalexpr::{eval_number_with_context, ContextWithMutableVariables, HashMapContext, Value};
use std::collections::HashMap;

/// Private variable environment of one lane run.
#[derive(Clone, Debug, Default)]
pub struct Variables {
    values: HashMap<String, f64>,
}

impl Variables {
    /// Empty environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of `name`.
    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    /// Number of assigned variables.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True when nothing was assigned yet.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Evaluate `name=expression` and insert or update `name`.
    pub fn assign(&mut self, statement: &str) -> GpibResult<f64> {
        let parts: Vec<&str> = statement.split('=').collect();
        let [name, expression] = parts.as_slice() else {
            return Err(GpibError::Expression(statement.to_string()));
        };
        let name = name.trim();
        if name.is_empty() {
            return Err(GpibError::Expression(statement.to_string()));
        }

        let mut context = HashMapContext::new();
        for (key, value) in &self.values {
            context
                .set_value(key.clone(), Value::Float(*value))
                .map_err(|e| GpibError::Expression(format!("{statement}: {e}")))?;
        }
        let value = eval_number_with_context(&widen_integer_literals(expression.trim()), &context)
            .map_err(|e| GpibError::Expression(format!("{statement}: {e}")))?;

        self.values.insert(name.to_string(), value);
        Ok(value)
    }

    /// Replace every `${name}` with the variable's value.
    ///
    /// Unknown names are left as they are.
    pub fn substitute(&self, text: &str) -> String {
        let mut out = text.to_string();
        for (name, value) in &self.values {
            let placeholder = format!("${{{name}}}");
            if out.contains(&placeholder) {
                out = out.replace(&placeholder, &format_significant(*value));
            }
        }
        out
    }
}

/// Rewrite integer literals as float literals (`7/2` becomes `7.0/2.0`) so
/// evalexpr does not fall back to integer arithmetic.
fn widen_integer_literals(expression: &str) -> String {
    let chars: Vec<char> = expression.chars().collect();
    let mut out = String::with_capacity(expression.len() + 8);
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let starts_number = c.is_ascii_digit()
            && !matches!(i.checked_sub(1).map(|p| chars[p]), Some(p) if p.is_alphanumeric() || p == '_' || p == '.');
        if !starts_number {
            out.push(c);
            i += 1;
            continue;
        }
        while i < chars.len() && chars[i].is_ascii_digit() {
            out.push(chars[i]);
            i += 1;
        }
        match chars.get(i) {
            Some('.' | 'e' | 'E') => {}
            _ => out.push_str(".0"),
        }
    }
    out
}

/// Render `value` with four significant digits, keeping trailing zeros.
///
/// Values of 10 000 and above are printed as integers.
pub fn format_significant(value: f64) -> String {
    const DIGITS: i32 = 4;
    if value == 0.0 || !value.is_finite() {
        return format!("{:.*}", (DIGITS - 1) as usize, value);
    }
    let decimals = |v: f64| (DIGITS - 1 - v.abs().log10().floor() as i32).max(0);
    let scale = 10f64.powi(decimals(value));
    // round half away from zero before formatting
    let rounded = (value * scale).round() / scale;
    // rounding may carry into the next decade (9.9996 -> 10.00)
    format!("{:.*}", decimals(rounded) as usize, rounded)
}
