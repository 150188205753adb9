//! Room document state: text, language tag, and the applied-operation log.
//!
//! The log is append-only and is an audit trail, not a replay source:
//! `content` is mutated in place as operations arrive. The invariant is that
//! replaying the log from the initial text would reproduce `content`.

use crate::operation::Operation;

/// Text a freshly created room starts with.
pub const DEFAULT_WELCOME_TEXT: &str =
    "// Welcome to Quill!\n// Share the room id with others to edit together.\n";

/// Language tag a freshly created room starts with.
pub const DEFAULT_LANGUAGE: &str = "javascript";

#[derive(Debug, Clone)]
pub struct Document {
    content: String,
    language: String,
    applied: Vec<Operation>,
}

impl Document {
    pub fn new(content: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            language: language.into(),
            applied: Vec::new(),
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn set_language(&mut self, language: impl Into<String>) {
        self.language = language.into();
    }

    /// Length of the content in operation units.
    pub fn len(&self) -> usize {
        self.content.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// Number of operations applied so far.
    pub fn revision(&self) -> u64 {
        self.applied.len() as u64
    }

    pub fn applied_operations(&self) -> &[Operation] {
        &self.applied
    }

    /// Operations applied after `revision`, oldest first.
    pub fn operations_since(&self, revision: u64) -> &[Operation] {
        let start = (revision as usize).min(self.applied.len());
        &self.applied[start..]
    }

    /// Rebase `op` over everything other connections applied after
    /// `base_revision`.
    ///
    /// The author's own operations are already in `op`'s coordinates, so
    /// they are not transformed against. Each foreign operation is first
    /// shifted over the author's operations logged after it, which puts it in
    /// the same coordinates as `op` before `op` is moved past it.
    pub fn rebase(&self, op: &Operation, base_revision: u64) -> Operation {
        let since = self.operations_since(base_revision);
        let is_own = |applied: &Operation| applied.origin_user == op.origin_user;

        since
            .iter()
            .enumerate()
            .filter(|(_, applied)| !is_own(*applied))
            .fold(op.clone(), |acc, (i, foreign)| {
                let lifted = since[i + 1..]
                    .iter()
                    .filter(|later| is_own(*later))
                    .fold(foreign.clone(), |f, own| f.transform(own));
                acc.transform(&lifted)
            })
    }

    /// Apply `op` in arrival order, log it, and return it as applied
    /// (clamped, with its revision assigned).
    pub fn apply(&mut self, op: &Operation) -> Operation {
        let mut applied = op.apply_to(&mut self.content);
        applied.revision = self.revision() + 1;
        self.applied.push(applied.clone());
        applied
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::new(DEFAULT_WELCOME_TEXT, DEFAULT_LANGUAGE)
    }
}
