use std::collections::BTreeMap;

/// Decision points where a destructive or lossy operation needs a human answer.
#[derive(Debug, Clone, PartialEq)]
pub enum Question<'a> {
    ProceedWithWarnings { warnings: &'a [String] },
    ClearExisting { records: u64 },
    ContinueWithoutBackup { error: &'a str },
    ConfirmDeletion { preview: &'a BTreeMap<String, u64> },
}

/// Whoever answers confirmation prompts: a terminal user, or a fixed policy for API callers.
pub trait Operator {
    fn confirm(&self, question: &Question<'_>) -> bool;

    /// Read a typed confirmation token. `None` means nobody is available to type one.
    fn typed_token(&self, _question: &Question<'_>) -> Option<String> {
        None
    }
}

/// Answers yes to every yes/no question. Never types tokens.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

impl Operator for AutoApprove {
    fn confirm(&self, _question: &Question<'_>) -> bool {
        true
    }
}

/// Answers no to everything; the non-interactive default.
#[derive(Debug, Clone, Copy, Default)]
pub struct Decline;

impl Operator for Decline {
    fn confirm(&self, _question: &Question<'_>) -> bool {
        false
    }
}
