// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The primitive changeset engine.
//!
//! A [`Changeset`] is an ordered log of primitive edits against a
//! [`LiveTree`].  Applying a changeset is failure-atomic: if an entry cannot
//! be applied, the already-applied prefix is rolled back in reverse order.
//! Reverting is symmetric, re-applying the already-reverted suffix on
//! failure.  Either recovery can itself fail; the caller learns about that
//! through [`ChangesetError::recovery_failed`] and must treat the tree as
//! suspect.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use log::debug;

use crate::tree::{LiveTree, NodeId, Property, TreeError};

/// A primitive edit against the live tree.
#[derive(Debug)]
pub enum ChangeAction {
    /// Link a detached node into its parent.
    AttachNode,
    /// Unlink a node from its parent.
    DetachNode,
    /// Add a property that must not yet exist.
    AddProperty(Property),
    /// Set a property's value, adding it if absent.
    UpdateProperty(Property),
    /// Remove a property that must exist.
    RemoveProperty(String),
}

/// One edit of a [`Changeset`], together with the state captured at apply
/// time that makes it reversible.
#[derive(Debug)]
pub struct ChangesetEntry {
    node: NodeId,
    action: ChangeAction,
    old: Option<Property>,
}

impl ChangesetEntry {
    /// Returns the node this edit refers to.
    #[must_use]
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Returns the edit's action.
    #[must_use]
    pub fn action(&self) -> &ChangeAction {
        &self.action
    }

    /// Returns the name of the property this edit refers to, if it is a
    /// property edit.
    #[must_use]
    pub fn property_name(&self) -> Option<&str> {
        match &self.action {
            ChangeAction::AttachNode | ChangeAction::DetachNode => None,
            ChangeAction::AddProperty(prop) | ChangeAction::UpdateProperty(prop) => {
                Some(prop.name())
            }
            ChangeAction::RemoveProperty(name) => Some(name),
        }
    }

    /// Returns whether this edit attaches or detaches a node.
    #[must_use]
    pub fn is_node_edit(&self) -> bool {
        matches!(
            self.action,
            ChangeAction::AttachNode | ChangeAction::DetachNode
        )
    }
}

/// An error from applying or reverting a changeset.
#[derive(Debug)]
pub struct ChangesetError {
    /// The tree edit failure that stopped the operation.
    pub error: TreeError,
    /// Index of the entry that failed.
    pub index: usize,
    /// Whether undoing the partial operation also failed.  When set, the
    /// state of the live tree is unknown.
    pub recovery_failed: bool,
}

impl fmt::Display for ChangesetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "changeset entry {} failed: {}", self.index, self.error)?;
        if self.recovery_failed {
            write!(f, " (recovery failed, tree state unknown)")?;
        }
        Ok(())
    }
}

impl core::error::Error for ChangesetError {}

/// An ordered, reversible log of primitive tree edits.
#[derive(Debug, Default)]
pub struct Changeset {
    entries: Vec<ChangesetEntry>,
}

impl Changeset {
    /// Creates an empty changeset.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the edits in application order.
    #[must_use]
    pub fn entries(&self) -> &[ChangesetEntry] {
        &self.entries
    }

    /// Returns whether the changeset holds no edits.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn push(&mut self, node: NodeId, action: ChangeAction) {
        self.entries.push(ChangesetEntry {
            node,
            action,
            old: None,
        });
    }

    /// Records an edit linking the detached `node` into its parent.
    pub fn attach_node(&mut self, node: NodeId) {
        self.push(node, ChangeAction::AttachNode);
    }

    /// Records an edit unlinking `node` from its parent.
    pub fn detach_node(&mut self, node: NodeId) {
        self.push(node, ChangeAction::DetachNode);
    }

    /// Records an edit adding `property` to `node`.
    pub fn add_property(&mut self, node: NodeId, property: Property) {
        self.push(node, ChangeAction::AddProperty(property));
    }

    /// Records an edit updating `property` on `node`.
    pub fn update_property(&mut self, node: NodeId, property: Property) {
        self.push(node, ChangeAction::UpdateProperty(property));
    }

    /// Records an edit removing the property named `name` from `node`.
    pub fn remove_property(&mut self, node: NodeId, name: impl Into<String>) {
        self.push(node, ChangeAction::RemoveProperty(name.into()));
    }

    /// Applies all edits to `tree` in order.
    ///
    /// # Errors
    ///
    /// If an edit fails, the already-applied prefix is rolled back in
    /// reverse order and the original failure is returned.  A rollback
    /// failure is reported through
    /// [`recovery_failed`](ChangesetError::recovery_failed); the tree state
    /// is then unknown.
    pub fn apply(&mut self, tree: &mut LiveTree) -> Result<(), ChangesetError> {
        for index in 0..self.entries.len() {
            if let Err(error) = Self::apply_entry(&mut self.entries[index], tree) {
                debug!("changeset apply failed at entry {index}: {error}");
                let mut recovery_failed = false;
                for undo in (0..index).rev() {
                    if let Err(e) = Self::revert_entry(&mut self.entries[undo], tree) {
                        debug!("changeset rollback failed at entry {undo}: {e}");
                        recovery_failed = true;
                    }
                }
                return Err(ChangesetError {
                    error,
                    index,
                    recovery_failed,
                });
            }
        }
        Ok(())
    }

    /// Reverts all edits on `tree` in reverse order.
    ///
    /// # Errors
    ///
    /// If an edit fails to revert, the already-reverted suffix is re-applied
    /// and the original failure is returned.  A re-apply failure is reported
    /// through [`recovery_failed`](ChangesetError::recovery_failed); the
    /// tree state is then unknown.
    pub fn revert(&mut self, tree: &mut LiveTree) -> Result<(), ChangesetError> {
        for index in (0..self.entries.len()).rev() {
            if let Err(error) = Self::revert_entry(&mut self.entries[index], tree) {
                debug!("changeset revert failed at entry {index}: {error}");
                let mut recovery_failed = false;
                for redo in index + 1..self.entries.len() {
                    if let Err(e) = Self::apply_entry(&mut self.entries[redo], tree) {
                        debug!("changeset re-apply failed at entry {redo}: {e}");
                        recovery_failed = true;
                    }
                }
                return Err(ChangesetError {
                    error,
                    index,
                    recovery_failed,
                });
            }
        }
        Ok(())
    }

    fn apply_entry(entry: &mut ChangesetEntry, tree: &mut LiveTree) -> Result<(), TreeError> {
        match &entry.action {
            ChangeAction::AttachNode => tree.attach(entry.node),
            ChangeAction::DetachNode => tree.detach(entry.node),
            ChangeAction::AddProperty(prop) => {
                if tree.property(entry.node, prop.name()).is_some() {
                    return Err(TreeError::PropertyExists);
                }
                tree.put_property(entry.node, prop.clone());
                Ok(())
            }
            ChangeAction::UpdateProperty(prop) => {
                entry.old = tree.put_property(entry.node, prop.clone());
                Ok(())
            }
            ChangeAction::RemoveProperty(name) => {
                entry.old = Some(
                    tree.remove_property(entry.node, name)
                        .ok_or(TreeError::PropertyMissing)?,
                );
                Ok(())
            }
        }
    }

    fn revert_entry(entry: &mut ChangesetEntry, tree: &mut LiveTree) -> Result<(), TreeError> {
        match &entry.action {
            ChangeAction::AttachNode => tree.detach(entry.node),
            ChangeAction::DetachNode => tree.attach(entry.node),
            ChangeAction::AddProperty(prop) => {
                tree.remove_property(entry.node, prop.name())
                    .ok_or(TreeError::PropertyMissing)?;
                Ok(())
            }
            ChangeAction::UpdateProperty(prop) => {
                match entry.old.take() {
                    Some(old) => {
                        tree.put_property(entry.node, old);
                    }
                    None => {
                        tree.remove_property(entry.node, prop.name())
                            .ok_or(TreeError::PropertyMissing)?;
                    }
                }
                Ok(())
            }
            ChangeAction::RemoveProperty(_name) => {
                let old = entry.old.take().ok_or(TreeError::PropertyMissing)?;
                tree.put_property(entry.node, old);
                Ok(())
            }
        }
    }
}
