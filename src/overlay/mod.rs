// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Applying and removing devicetree overlays.
//!
//! [`OverlayManager`] owns the live tree and the registry of applied
//! overlays.  [`apply_fdt`](OverlayManager::apply_fdt) unflattens an overlay
//! blob, resolves its phandles, decomposes its fragments into a changeset of
//! primitive edits and applies them as a unit; on failure the live tree is
//! rolled back.  [`remove`](OverlayManager::remove) reverts a recorded
//! overlay, which is only permitted while no later overlay has edited any of
//! the same nodes or their ancestors or descendants.
//!
//! If a rollback or a revert recovery itself fails, the state of the live
//! tree is unknown; a sticky corruption latch then refuses all further
//! apply and remove operations.

mod build;
mod error;
mod notify;

pub use error::{ErrorClass, OverlayError, OverlayErrorKind};
pub use notify::{NotifierId, NotifyState, OverlayEvent};

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;

use bitflags::bitflags;
use indexmap::IndexMap;
use log::{debug, error};
use spin::Mutex;
use twox_hash::xxhash64;

use crate::changeset::{ChangeAction, Changeset};
use crate::fdt::Fdt;
use crate::resolver;
use crate::tree::{LiveTree, NodeFlags, NodeId};
use notify::NotifierBus;

/// The identifier of a recorded overlay changeset.
///
/// Returned by [`OverlayManager::apply_fdt`] and consumed by
/// [`OverlayManager::remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OverlayId(usize);

impl OverlayId {
    /// Returns the numeric id.
    #[must_use]
    pub fn get(self) -> usize {
        self.0
    }
}

impl fmt::Display for OverlayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

bitflags! {
    /// Sticky failure state.  Once a bit is set it is never cleared.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    struct StateFlags: u8 {
        const APPLY_FAIL = 1 << 0;
        const REVERT_FAIL = 1 << 1;
    }
}

/// One targeted merge unit of an overlay: the `__overlay__` subtree and the
/// live node it grafts onto.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Fragment {
    pub(crate) overlay: NodeId,
    pub(crate) target: NodeId,
}

/// A recorded overlay: its fragments, the changeset that realized it on the
/// live tree, and the retained unflattened overlay subtree.
pub(crate) struct OverlayChangeset {
    id: usize,
    /// Root of the unflattened overlay, detached in the live tree's arena.
    /// Owned by this changeset until the post-remove phase.
    pub(crate) overlay_root: NodeId,
    pub(crate) fragments: Vec<Fragment>,
    /// Whether the final element of `fragments` is the symbols fragment.
    pub(crate) symbols_fragment: bool,
    pub(crate) cset: Changeset,
    notify_state: NotifyState,
}

struct ManagerState {
    tree: LiveTree,
    /// Recorded overlays keyed by id; iteration order is apply order, the
    /// last entry is the topmost overlay.
    registry: IndexMap<usize, OverlayChangeset, xxhash64::State>,
    next_id: usize,
    notifiers: NotifierBus,
    state_flags: StateFlags,
}

impl ManagerState {
    /// If a changeset apply or revert encountered an error, an attempt was
    /// made to undo partial changes, but may have failed.  If the undo
    /// failed we do not know the state of the devicetree.
    fn corrupt(&self) -> bool {
        self.state_flags
            .intersects(StateFlags::APPLY_FAIL | StateFlags::REVERT_FAIL)
    }
}

/// The devicetree overlay engine.
///
/// Owns the live tree, the registry of applied overlays and the notifier
/// bus.  All mutation is serialized by an internal lock; a second lock is
/// held across the window from phandle resolution to primitive apply so
/// that two overlays cannot collide on phandle allocation.
///
/// # Examples
///
/// ```
/// # use dt_overlay::{OverlayManager, tree::{LiveTree, Property}, writer};
/// // Live tree: / { a { }; };
/// let mut live = LiveTree::new();
/// live.add_child(live.root(), "a").unwrap();
/// let manager = OverlayManager::new(live);
///
/// // Overlay: / { fragment@0 { target-path = "/a"; __overlay__ { q = "y"; }; }; };
/// let mut overlay = LiveTree::new();
/// let frag = overlay.add_child(overlay.root(), "fragment@0").unwrap();
/// overlay.add_property(frag, Property::from_str("target-path", "/a"));
/// let content = overlay.add_child(frag, "__overlay__").unwrap();
/// overlay.add_property(content, Property::from_str("q", "y"));
/// let blob = writer::to_dtb(&overlay, overlay.root());
///
/// let id = manager.apply_fdt(&blob, None).unwrap();
/// manager.with_tree(|tree| {
///     let a = tree.find_by_path("/a").unwrap();
///     assert_eq!(tree.property(a, "q").unwrap().as_str(), Ok("y"));
/// });
/// manager.remove(id).unwrap();
/// ```
pub struct OverlayManager {
    /// Held across phandle resolution and primitive apply.  Always acquired
    /// before `state`.
    phandle_lock: Mutex<()>,
    state: Mutex<ManagerState>,
}

impl OverlayManager {
    /// Creates a manager owning `tree` as the live tree.
    #[must_use]
    pub fn new(tree: LiveTree) -> Self {
        Self {
            phandle_lock: Mutex::new(()),
            state: Mutex::new(ManagerState {
                tree,
                registry: IndexMap::with_hasher(xxhash64::State::with_seed(0xdead_cafe)),
                next_id: 1,
                notifiers: NotifierBus::default(),
                state_flags: StateFlags::empty(),
            }),
        }
    }

    /// Runs `f` with read access to the live tree.
    pub fn with_tree<R>(&self, f: impl FnOnce(&LiveTree) -> R) -> R {
        f(&self.state.lock().tree)
    }

    /// Returns whether a failed recovery has left the live tree state
    /// unknown.  Once set, apply and remove refuse to run.
    #[must_use]
    pub fn corrupted(&self) -> bool {
        self.state.lock().corrupt()
    }

    /// Returns the ids of the recorded overlays in apply order.
    #[must_use]
    pub fn applied_overlays(&self) -> Vec<OverlayId> {
        self.state.lock().registry.keys().map(|&id| OverlayId(id)).collect()
    }

    /// Registers a notifier callback for overlay events.
    ///
    /// The callback runs under the manager's lock and must not call back
    /// into the manager.  It must not retain overlay node handles past the
    /// post-remove event of the overlay that produced them.
    pub fn notifier_register(
        &self,
        callback: impl FnMut(&LiveTree, &OverlayEvent<'_>) -> Result<(), OverlayError>
        + Send
        + 'static,
    ) -> NotifierId {
        self.state.lock().notifiers.register(Box::new(callback))
    }

    /// Unregisters a notifier callback.  Returns whether it was registered.
    pub fn notifier_unregister(&self, id: NotifierId) -> bool {
        self.state.lock().notifiers.unregister(id)
    }

    /// Creates and applies an overlay changeset from an FDT blob.
    ///
    /// `target_base` resolves fragment `target-path` properties relative to
    /// a live node instead of the root.
    ///
    /// # Errors
    ///
    /// On most failures the overlay is discarded and the live tree is
    /// untouched.  If the overlay was applied but a post-apply notifier
    /// failed, the error carries the changeset id in
    /// [`OverlayError::changeset`] and the caller should pass it to
    /// [`remove`](Self::remove).
    pub fn apply_fdt(
        &self,
        blob: &[u8],
        target_base: Option<NodeId>,
    ) -> Result<OverlayId, OverlayError> {
        let _phandle_guard = self.phandle_lock.lock();
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if state.corrupt() {
            error!("devicetree state suspect, refuse to apply overlay");
            return Err(OverlayError::new(OverlayErrorKind::TreeCorrupt, ""));
        }

        let fdt = Fdt::new(blob).map_err(|e| {
            error!("invalid overlay blob header");
            OverlayError::from(e)
        })?;

        // The unflattened copy is what the changeset retains; the caller's
        // blob is not referenced after this point.
        let overlay_root = state.tree.unflatten(&fdt)?;

        let id = state.next_id;
        state.next_id += 1;
        state.registry.insert(
            id,
            OverlayChangeset {
                id,
                overlay_root,
                fragments: Vec::new(),
                symbols_fragment: false,
                cset: Changeset::new(),
                notify_state: NotifyState::Init,
            },
        );

        Self::overlay_apply(state, id, target_base).map(|()| OverlayId(id))
    }

    /// Runs the apply pipeline for the registered changeset `id`.
    ///
    /// Failures before the primitive apply free the changeset.  A failed
    /// primitive apply is rolled back and then freed, unless the rollback
    /// itself failed, which latches the corruption state.  A post-apply
    /// notifier failure leaves the changeset applied and recorded.
    fn overlay_apply(
        state: &mut ManagerState,
        id: usize,
        target_base: Option<NodeId>,
    ) -> Result<(), OverlayError> {
        let overlay_root = state
            .registry
            .get(&id)
            .expect("changeset is registered")
            .overlay_root;

        if let Err(e) = resolver::resolve(&mut state.tree, overlay_root) {
            return Err(Self::fail_and_free(state, id, e));
        }

        if let Err(e) = Self::init_overlay_changeset(state, id, target_base) {
            return Err(Self::fail_and_free(state, id, e));
        }

        if let Err(e) = Self::overlay_notify(state, id, NotifyState::PreApply) {
            return Err(Self::fail_and_free(state, id, e));
        }

        let build_result = {
            let ManagerState { tree, registry, .. } = &mut *state;
            let ovcs = registry.get_mut(&id).expect("changeset is registered");
            build::build_changeset(tree, ovcs)
        };
        if let Err(e) = build_result {
            return Err(Self::fail_and_free(state, id, e));
        }

        let apply_result = {
            let ManagerState { tree, registry, .. } = &mut *state;
            let ovcs = registry.get_mut(&id).expect("changeset is registered");
            ovcs.cset.apply(tree)
        };
        if let Err(e) = apply_result {
            if e.recovery_failed {
                debug!("overlay changeset revert error");
                state.state_flags |= StateFlags::APPLY_FAIL;
                return Err(OverlayError::from(e).with_changeset(OverlayId(id)));
            }
            return Err(Self::fail_and_free(state, id, e.into()));
        }

        if let Err(e) = Self::notify_edits(state, id, true) {
            error!("overlay apply changeset entry notify error {e}");
        }

        if let Err(e) = Self::overlay_notify(state, id, NotifyState::PostApply) {
            // The changeset stays applied; removal is the remediation.
            return Err(e.with_changeset(OverlayId(id)));
        }

        Ok(())
    }

    /// Populates the fragment array from the top level of the overlay root.
    ///
    /// The relevant top level nodes are the fragment nodes and the
    /// `__symbols__` node; any other top level node is ignored.
    fn init_overlay_changeset(
        state: &mut ManagerState,
        id: usize,
        target_base: Option<NodeId>,
    ) -> Result<(), OverlayError> {
        let tree = &state.tree;
        let overlay_root = state
            .registry
            .get(&id)
            .expect("changeset is registered")
            .overlay_root;

        if !tree.flags(overlay_root).contains(NodeFlags::DYNAMIC) {
            debug!("overlay root is not dynamic");
        }
        if !tree.flags(overlay_root).contains(NodeFlags::DETACHED) {
            debug!("overlay root is not detached");
        }
        if tree.parent(overlay_root).is_some() {
            debug!("overlay root is not a root");
        }

        let mut fragments: Vec<Fragment> = Vec::new();
        for node in tree.children(overlay_root) {
            if let Some(overlay) = tree.child(node, "__overlay__") {
                let target = build::find_target(tree, node, target_base)?;
                fragments.push(Fragment { overlay, target });
            }
        }

        let mut symbols_fragment = false;
        if let Some(symbols) = tree.child(overlay_root, "__symbols__") {
            let Some(target) = tree.find_by_path("/__symbols__") else {
                error!("symbols in overlay, but not in live tree");
                return Err(OverlayError::new(
                    OverlayErrorKind::SymbolsMissing,
                    "/__symbols__",
                ));
            };
            // The symbols fragment is the final element of the array.
            symbols_fragment = true;
            fragments.push(Fragment {
                overlay: symbols,
                target,
            });
        }

        if fragments.is_empty() {
            error!("no fragments or symbols in overlay");
            return Err(OverlayError::new(OverlayErrorKind::NoFragments, ""));
        }

        let ovcs = state.registry.get_mut(&id).expect("changeset is registered");
        ovcs.fragments = fragments;
        ovcs.symbols_fragment = symbols_fragment;
        Ok(())
    }

    /// Moves the changeset to `action` and broadcasts it per fragment.  The
    /// first subscriber error aborts the broadcast.
    fn overlay_notify(
        state: &mut ManagerState,
        id: usize,
        action: NotifyState,
    ) -> Result<(), OverlayError> {
        let ManagerState {
            tree,
            registry,
            notifiers,
            ..
        } = &mut *state;
        let ovcs = registry.get_mut(&id).expect("changeset is registered");
        ovcs.notify_state = action;

        for fragment in &ovcs.fragments {
            let event = OverlayEvent::Fragment {
                action,
                overlay: fragment.overlay,
                target: fragment.target,
            };
            if let Err(e) = notifiers.notify(tree, &event) {
                error!(
                    "overlay changeset {} notifier error {}, target: {}",
                    action.action_name(),
                    e,
                    tree.path(fragment.target)
                );
                return Err(e);
            }
        }

        Ok(())
    }

    /// Re-broadcasts each edit of the changeset after it took effect (or
    /// was undone).  Stops at the first subscriber error.
    fn notify_edits(
        state: &mut ManagerState,
        id: usize,
        applied: bool,
    ) -> Result<(), OverlayError> {
        let ManagerState {
            tree,
            registry,
            notifiers,
            ..
        } = &mut *state;
        let ovcs = registry.get(&id).expect("changeset is registered");

        for entry in ovcs.cset.entries() {
            let event = if applied {
                OverlayEvent::EditApplied(entry)
            } else {
                OverlayEvent::EditReverted(entry)
            };
            notifiers.notify(tree, &event)?;
        }
        Ok(())
    }

    fn fail_and_free(state: &mut ManagerState, id: usize, error: OverlayError) -> OverlayError {
        Self::free_overlay_changeset(state, id);
        error
    }

    /// Drops a changeset from the registry and frees the nodes it owns: any
    /// synthesized node not linked into the live tree, and the retained
    /// overlay subtree.
    fn free_overlay_changeset(state: &mut ManagerState, id: usize) {
        let Some(ovcs) = state.registry.shift_remove(&id) else {
            return;
        };

        for entry in ovcs.cset.entries() {
            if matches!(entry.action(), ChangeAction::AttachNode)
                && state.tree.flags(entry.node()).contains(NodeFlags::DETACHED)
            {
                state.tree.free(entry.node());
            }
        }

        state.tree.free_subtree(ovcs.overlay_root);
    }

    /// We can safely remove an overlay only if it is the topmost one:
    /// newly applied overlays are appended to the registry, and removal is
    /// refused if any later changeset edited a node that is an ancestor of,
    /// a descendant of, or the same as a node this changeset edited.
    ///
    /// Overlap is determined by live-tree parent traversal, not by path
    /// string comparison.
    fn removal_is_ok(state: &ManagerState, id: usize) -> bool {
        let position = state
            .registry
            .get_index_of(&id)
            .expect("caller checked the id");

        for (_, later) in state.registry.iter().skip(position + 1) {
            for later_entry in later.cset.entries() {
                for remove_entry in state.registry[position].cset.entries() {
                    if state
                        .tree
                        .subtree_contains(later_entry.node(), remove_entry.node())
                        || state
                            .tree
                            .subtree_contains(remove_entry.node(), later_entry.node())
                    {
                        error!(
                            "overlay #{} overlaps with #{} @{}",
                            id,
                            later.id,
                            state.tree.path(remove_entry.node())
                        );
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Reverts and frees a recorded overlay changeset.
    ///
    /// # Errors
    ///
    /// Fails with a `Busy`-class error if the corruption latch is set or the
    /// overlay is not topmost, and with a `NoDev`-class error if `id` is
    /// unknown.  A pre-remove notifier veto aborts without reverting.  If
    /// the revert itself fails the changeset stays recorded; a post-remove
    /// notifier error is surfaced after the changeset is freed.
    pub fn remove(&self, id: OverlayId) -> Result<(), OverlayError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if state.corrupt() {
            error!("suspect devicetree state, refuse to remove overlay");
            return Err(OverlayError::new(OverlayErrorKind::TreeCorrupt, ""));
        }

        if !state.registry.contains_key(&id.0) {
            error!("remove: Could not find overlay {id}");
            return Err(OverlayError::new(OverlayErrorKind::UnknownId, ""));
        }

        if !Self::removal_is_ok(state, id.0) {
            error!("overlay {id} is not topmost");
            return Err(OverlayError::new(OverlayErrorKind::NotTopmost, ""));
        }

        Self::overlay_notify(state, id.0, NotifyState::PreRemove)?;

        let revert_result = {
            let ManagerState { tree, registry, .. } = &mut *state;
            let ovcs = registry.get_mut(&id.0).expect("checked above");
            ovcs.cset.revert(tree)
        };
        if let Err(e) = revert_result {
            if e.recovery_failed {
                state.state_flags |= StateFlags::REVERT_FAIL;
            }
            return Err(OverlayError::from(e).with_changeset(id));
        }

        if let Err(e) = Self::notify_edits(state, id.0, false) {
            error!("overlay remove changeset entry notify error {e}");
        }

        let ret = Self::overlay_notify(state, id.0, NotifyState::PostRemove);

        // The overlay memory is freed even if a post-remove notifier
        // returned an error.
        Self::free_overlay_changeset(state, id.0);

        ret
    }

    /// Reverts and frees all overlay changesets, newest first.
    ///
    /// # Errors
    ///
    /// Stops at the first failing removal and returns its error.
    pub fn remove_all(&self) -> Result<(), OverlayError> {
        // The tail of the registry is guaranteed to be safe to remove.
        loop {
            let last = {
                let state = self.state.lock();
                state.registry.keys().next_back().copied()
            };
            let Some(id) = last else {
                return Ok(());
            };
            self.remove(OverlayId(id))?;
        }
    }
}
