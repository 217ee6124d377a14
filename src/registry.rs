//! Command path registry for one invoke transaction.
//!
//! Maps each command in a batch to its path and optional ref, and enforces the
//! uniqueness rules that make reply correlation unambiguous: a ref never repeats,
//! and a path repeats only when every occurrence carries its own ref.

use crate::error::InvokeError;
use crate::path::{CommandRef, ConcreteCommandPath};

/// Default number of paths a single invoke may carry.
pub const DEFAULT_MAX_PATHS_PER_INVOKE: u16 = 1;

/// Stable index of a registered command, valid for the rest of the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistryIndex(usize);

impl RegistryIndex {
    /// Position of the command in batch order.
    pub fn position(self) -> usize {
        self.0
    }
}

/// One registered command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    /// Request path.
    pub path: ConcreteCommandPath,
    /// Ref, if the command carried one.
    pub command_ref: Option<CommandRef>,
}

/// Bounded `(path, ref)` table.
#[derive(Debug, Clone)]
pub struct CommandPathRegistry {
    entries: Vec<RegistryEntry>,
    capacity: usize,
}

impl CommandPathRegistry {
    /// Registry holding at most `capacity` commands.
    pub fn new(capacity: usize) -> Self {
        Self { entries: Vec::with_capacity(capacity.min(64)), capacity }
    }

    /// Maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of registered commands.
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Check whether `add` would succeed, without registering.
    pub fn check(
        &self,
        path: &ConcreteCommandPath,
        command_ref: Option<CommandRef>,
    ) -> Result<(), InvokeError> {
        if let Some(r) = command_ref {
            if self.entries.iter().any(|e| e.command_ref == Some(r)) {
                return Err(InvokeError::DuplicateRef { command_ref: r });
            }
        }
        let ambiguous = self
            .entries
            .iter()
            .any(|e| e.path == *path && (command_ref.is_none() || e.command_ref.is_none()));
        if ambiguous {
            return Err(InvokeError::DuplicatePath { path: *path });
        }
        if self.entries.len() >= self.capacity {
            return Err(InvokeError::CapacityExceeded { capacity: self.capacity });
        }
        Ok(())
    }

    /// Register a command.
    pub fn add(
        &mut self,
        path: ConcreteCommandPath,
        command_ref: Option<CommandRef>,
    ) -> Result<RegistryIndex, InvokeError> {
        self.check(&path, command_ref)?;
        self.entries.push(RegistryEntry { path, command_ref });
        Ok(RegistryIndex(self.entries.len() - 1))
    }

    /// Find a command by exact path, using the ref to disambiguate when present.
    pub fn find(
        &self,
        path: &ConcreteCommandPath,
        command_ref: Option<CommandRef>,
    ) -> Option<RegistryIndex> {
        self.find_matching(command_ref, |p| p == path)
    }

    /// Find the command a data reply answers. Data replies carry the response id in
    /// place of the command id, so only endpoint and cluster are compared.
    pub fn find_by_cluster(
        &self,
        path: &ConcreteCommandPath,
        command_ref: Option<CommandRef>,
    ) -> Option<RegistryIndex> {
        self.find_matching(command_ref, |p| p.same_cluster(path))
    }

    fn find_matching(
        &self,
        command_ref: Option<CommandRef>,
        matches: impl Fn(&ConcreteCommandPath) -> bool,
    ) -> Option<RegistryIndex> {
        if let Some(r) = command_ref {
            return self
                .entries
                .iter()
                .position(|e| e.command_ref == Some(r) && matches(&e.path))
                .map(RegistryIndex);
        }
        if let Some(pos) =
            self.entries.iter().position(|e| e.command_ref.is_none() && matches(&e.path))
        {
            return Some(RegistryIndex(pos));
        }
        let mut candidates = self.entries.iter().enumerate().filter(|(_, e)| matches(&e.path));
        match (candidates.next(), candidates.next()) {
            (Some((pos, _)), None) => Some(RegistryIndex(pos)),
            _ => None,
        }
    }

    /// Entry at `index`.
    pub fn get(&self, index: RegistryIndex) -> Option<&RegistryEntry> {
        self.entries.get(index.0)
    }

    /// Entries in batch order.
    pub fn iter(&self) -> impl Iterator<Item = (RegistryIndex, &RegistryEntry)> {
        self.entries.iter().enumerate().map(|(i, e)| (RegistryIndex(i), e))
    }
}
