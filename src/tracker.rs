//! Outstanding command refs for one batched invoke.
use crate::error::InvokeError;
use crate::path::CommandRef;
use std::collections::BTreeSet;

/// Set of refs still waiting for a reply.
#[derive(Debug, Default, Clone)]
pub struct PendingResponseTracker {
    pending: BTreeSet<CommandRef>,
}

impl PendingResponseTracker {
    /// Empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start waiting for `command_ref`.
    pub fn add(&mut self, command_ref: CommandRef) -> Result<(), InvokeError> {
        if !self.pending.insert(command_ref) {
            return Err(InvokeError::DuplicateRef { command_ref });
        }
        Ok(())
    }

    /// Resolve `command_ref`. False when it was never requested or already resolved.
    pub fn received(&mut self, command_ref: CommandRef) -> bool {
        self.pending.remove(&command_ref)
    }

    /// Whether `command_ref` is still outstanding.
    pub fn is_tracked(&self, command_ref: CommandRef) -> bool {
        self.pending.contains(&command_ref)
    }

    /// Number of outstanding refs.
    pub fn count(&self) -> usize {
        self.pending.len()
    }

    /// Take every outstanding ref, in ascending order, leaving the tracker empty.
    pub fn drain_as_no_response(&mut self) -> impl Iterator<Item = CommandRef> {
        std::mem::take(&mut self.pending).into_iter()
    }
}
