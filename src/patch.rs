use serde::Serialize;

use crate::catalog::{BootIdentity, Gate};
use crate::error::{Error, Result};

/// One find/replace rule.
///
/// `pattern` and `replacement` always have the same length; the constructor
/// refuses anything else so a malformed directive never reaches a buffer.
///
/// The wildcard byte, when set, matches any byte in `pattern` and means
/// "keep the original byte" in `replacement`. A real occurrence of that byte
/// value can therefore neither be matched exactly nor written, so pick a
/// value the target data does not need at the wildcarded positions, or leave
/// the wildcard unset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PatchDirective {
    label: String,
    pattern: Vec<u8>,
    replacement: Vec<u8>,
    wildcard: Option<u8>,
    count: i32,
    gate: Gate,
    enabled: bool,
}

impl PatchDirective {
    pub fn new(
        label: impl Into<String>,
        pattern: impl Into<Vec<u8>>,
        replacement: impl Into<Vec<u8>>,
    ) -> Result<Self> {
        let label = label.into();
        let pattern = pattern.into();
        let replacement = replacement.into();
        if pattern.len() != replacement.len() {
            return Err(Error::MalformedDirective {
                label,
                pattern_len: pattern.len(),
                replacement_len: replacement.len(),
            });
        }
        Ok(PatchDirective {
            label,
            pattern,
            replacement,
            wildcard: None,
            count: 0,
            gate: Gate::default(),
            enabled: true,
        })
    }

    pub fn with_wildcard(mut self, wildcard: Option<u8>) -> Self {
        self.wildcard = wildcard;
        self
    }

    /// Maximum number of replacements; zero or negative is unbounded.
    pub fn with_count(mut self, count: i32) -> Self {
        self.count = count;
        self
    }

    pub fn with_gate(mut self, gate: Gate) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn pattern(&self) -> &[u8] {
        &self.pattern
    }

    pub fn replacement(&self) -> &[u8] {
        &self.replacement
    }

    pub fn wildcard(&self) -> Option<u8> {
        self.wildcard
    }

    pub fn count(&self) -> i32 {
        self.count
    }

    pub fn gate(&self) -> &Gate {
        &self.gate
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn limit(&self) -> Option<usize> {
        if self.count > 0 {
            Some(self.count as usize)
        } else {
            None
        }
    }

    /// Enabled and admitted by the gate for this boot attempt.
    pub fn is_eligible(&self, identity: &BootIdentity) -> bool {
        self.enabled && self.gate.admits(identity)
    }

    /// The same directive with pattern and replacement swapped.
    pub fn inverse(&self) -> Self {
        PatchDirective {
            label: format!("{} (inverse)", self.label),
            pattern: self.replacement.clone(),
            replacement: self.pattern.clone(),
            ..self.clone()
        }
    }

    fn matches_at(&self, window: &[u8]) -> bool {
        self.pattern
            .iter()
            .zip(window)
            .all(|(want, have)| Some(*want) == self.wildcard || want == have)
    }

    fn write_at(&self, window: &mut [u8]) {
        for (slot, byte) in window.iter_mut().zip(&self.replacement) {
            if Some(*byte) != self.wildcard {
                *slot = *byte;
            }
        }
    }

    /// Applies the directive to `buf`, returning the number of replacements.
    ///
    /// Matches never overlap: after a hit the scan resumes right after the
    /// matched region. Zero replacements is a normal outcome.
    pub fn apply(&self, buf: &mut [u8]) -> usize {
        let len = self.pattern.len();
        if len == 0 || buf.len() < len {
            return 0;
        }

        let limit = self.limit();
        let mut replaced = 0;
        let mut cursor = 0;
        while cursor + len <= buf.len() {
            if limit.map_or(false, |limit| replaced >= limit) {
                break;
            }
            let window = &mut buf[cursor..cursor + len];
            if self.matches_at(window) {
                self.write_at(window);
                replaced += 1;
                cursor += len;
            } else {
                cursor += 1;
            }
        }
        replaced
    }
}

/// Where a patch landed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum PatchTarget {
    Core,
    Booter,
    Driver { name: String, info_plist: bool },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PatchRecord {
    pub label: String,
    pub target: PatchTarget,
    pub replacements: usize,
}

/// Outcome of every directive run during one boot attempt, in application
/// order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PatchReport {
    pub records: Vec<PatchRecord>,
    /// Directives that never ran: disabled, gated out, or aimed at an image
    /// that was not loaded.
    pub skipped: usize,
}

impl PatchReport {
    pub fn record(&mut self, directive: &PatchDirective, target: PatchTarget, replacements: usize) {
        self.records.push(PatchRecord {
            label: directive.label().to_string(),
            target,
            replacements,
        });
    }

    pub fn total(&self) -> usize {
        self.records.iter().map(|record| record.replacements).sum()
    }

    pub fn replacements_for(&self, label: &str) -> usize {
        self.records
            .iter()
            .filter(|record| record.label == label)
            .map(|record| record.replacements)
            .sum()
    }
}
