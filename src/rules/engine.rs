//! Target authorization engine
//!
//! Compiles the configured allow-list once at startup and evaluates
//! targets against it on every request. Evaluation is read-only and
//! lock-free; the authorizer is shared across acceptors behind an `Arc`.

use tracing::debug;

use super::types::TargetRule;
use crate::error::RuleError;

/// Compiled allow-list evaluated in insertion order
///
/// An empty rule list allows every target. The first matching rule wins;
/// there are no deny rules.
#[derive(Debug, Default)]
pub struct TargetAuthorizer {
    rules: Vec<TargetRule>,
}

impl TargetAuthorizer {
    /// Compile an allow-list into an authorizer
    ///
    /// # Errors
    ///
    /// Returns [`RuleError`] on the first entry that fails to compile.
    /// A compile error is fatal at startup.
    pub fn compile(entries: &[String]) -> Result<Self, RuleError> {
        let rules = entries
            .iter()
            .map(|e| TargetRule::compile(e))
            .collect::<Result<Vec<_>, _>>()?;

        debug!(rules = rules.len(), "compiled target allow-list");
        Ok(Self { rules })
    }

    /// Check whether a `host:port` target is allowed
    #[must_use]
    pub fn is_allowed(&self, target: &str) -> bool {
        if self.rules.is_empty() {
            return true;
        }
        self.rules.iter().any(|r| r.matches(target))
    }

    /// Number of compiled rules
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the allow-list is empty (allow all)
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
