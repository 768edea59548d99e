// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The overlay notifier bus.
//!
//! Subscribers observe overlay lifecycle phases and the individual tree
//! edits an overlay makes.  Dispatch is synchronous and runs under the
//! manager's state lock, so callbacks must not call back into the manager.
//! Callbacks must not retain overlay node handles past the
//! [`PostRemove`](NotifyState::PostRemove) phase of the overlay that
//! produced them.

use alloc::boxed::Box;
use alloc::vec::Vec;

use super::error::OverlayError;
use crate::changeset::ChangesetEntry;
use crate::tree::{LiveTree, NodeId};

/// The lifecycle phases of an overlay changeset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyState {
    /// Allocated but not yet announced.
    Init,
    /// About to be applied; subscribers may veto.
    PreApply,
    /// Applied to the live tree.
    PostApply,
    /// About to be reverted; subscribers may veto.
    PreRemove,
    /// Reverted and about to be freed.
    PostRemove,
}

impl NotifyState {
    /// Returns the phase name used in diagnostics.
    #[must_use]
    pub fn action_name(self) -> &'static str {
        match self {
            NotifyState::Init => "init",
            NotifyState::PreApply => "pre-apply",
            NotifyState::PostApply => "post-apply",
            NotifyState::PreRemove => "pre-remove",
            NotifyState::PostRemove => "post-remove",
        }
    }
}

/// An event delivered to overlay notifiers.
#[derive(Debug)]
pub enum OverlayEvent<'a> {
    /// A lifecycle phase, broadcast once per fragment.
    Fragment {
        /// The phase being announced.
        action: NotifyState,
        /// The fragment's `__overlay__` subtree.
        overlay: NodeId,
        /// The live node the fragment grafts onto.
        target: NodeId,
    },
    /// A primitive edit took effect on the live tree.
    EditApplied(&'a ChangesetEntry),
    /// A primitive edit was undone on the live tree.
    EditReverted(&'a ChangesetEntry),
}

/// A handle identifying a registered notifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NotifierId(u64);

type NotifierFn = Box<dyn FnMut(&LiveTree, &OverlayEvent<'_>) -> Result<(), OverlayError> + Send>;

/// The subscriber registry: callback and cookie pairs, notified in
/// registration order.
#[derive(Default)]
pub(super) struct NotifierBus {
    subscribers: Vec<(NotifierId, NotifierFn)>,
    next: u64,
}

impl NotifierBus {
    pub(super) fn register(&mut self, callback: NotifierFn) -> NotifierId {
        let id = NotifierId(self.next);
        self.next += 1;
        self.subscribers.push((id, callback));
        id
    }

    pub(super) fn unregister(&mut self, id: NotifierId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sub_id, _)| *sub_id != id);
        self.subscribers.len() != before
    }

    /// Broadcasts `event`, stopping at the first subscriber error.
    pub(super) fn notify(
        &mut self,
        tree: &LiveTree,
        event: &OverlayEvent<'_>,
    ) -> Result<(), OverlayError> {
        for (_, callback) in &mut self.subscribers {
            callback(tree, event)?;
        }
        Ok(())
    }
}
