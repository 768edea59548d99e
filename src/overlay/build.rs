// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Decomposing overlay fragments into primitive changeset edits.
//!
//! The builder walks each fragment's `__overlay__` subtree while a target
//! cursor tracks the corresponding position in the live tree.  As long as
//! the overlay node exists at the same level of the live tree the cursor
//! stays in the live tree; once an overlay node has no live counterpart a
//! node is synthesized and the rest of that subtree is built against
//! synthesized nodes.

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use log::{debug, error, warn};

use super::error::{OverlayError, OverlayErrorKind};
use super::{Fragment, OverlayChangeset};
use crate::changeset::Changeset;
use crate::tree::{basename, is_pseudo_property, LiveTree, NodeFlags, NodeId, Property};

/// Where the current level of the overlay walk lands in the live tree.
///
/// `in_livetree` is false once `node` (and therefore every node below it)
/// is a synthesized node carried by the changeset rather than a node of the
/// live tree.
#[derive(Clone, Copy)]
struct Target {
    node: NodeId,
    in_livetree: bool,
}

/// Locates a fragment's live-tree attachment point.
///
/// Strategies in order of preference:
///
/// 1. a `target` property containing the phandle of the target;
/// 2. a `target-path` property containing the path of the target, resolved
///    under `target_base` when one is given.
pub(super) fn find_target(
    tree: &LiveTree,
    info_node: NodeId,
    target_base: Option<NodeId>,
) -> Result<NodeId, OverlayError> {
    if let Some(phandle) = tree
        .property(info_node, "target")
        .and_then(|prop| prop.as_u32().ok())
    {
        return tree.find_by_phandle(phandle).ok_or_else(|| {
            error!(
                "find target, node: {}, phandle 0x{:x} not found",
                tree.path(info_node),
                phandle
            );
            OverlayError::new(OverlayErrorKind::TargetNotFound, tree.path(info_node))
        });
    }

    if let Some(path) = tree
        .property(info_node, "target-path")
        .and_then(|prop| prop.as_str().ok())
    {
        let node = match target_base {
            Some(base) => {
                let mut target_path = tree.path(base);
                if target_path == "/" {
                    target_path.clear();
                }
                target_path.push_str(path);
                tree.find_by_path(&target_path)
            }
            None => tree.find_by_path(path),
        };
        return node.ok_or_else(|| {
            error!(
                "find target, node: {}, path '{}' not found",
                tree.path(info_node),
                path
            );
            OverlayError::new(OverlayErrorKind::TargetNotFound, tree.path(info_node))
        });
    }

    error!("find target, node: {}, no target property", tree.path(info_node));
    Err(OverlayError::new(
        OverlayErrorKind::NoTarget,
        tree.path(info_node),
    ))
}

/// Populates `ovcs.cset` from `ovcs.fragments`.
///
/// If an error occurs, any edits that were already created remain in the
/// changeset; the caller must not apply it.
pub(super) fn build_changeset(
    tree: &mut LiveTree,
    ovcs: &mut OverlayChangeset,
) -> Result<(), OverlayError> {
    // If there is a symbols fragment it is the final element of the array.
    let fragments_count = if ovcs.symbols_fragment {
        ovcs.fragments.len() - 1
    } else {
        ovcs.fragments.len()
    };

    for index in 0..fragments_count {
        let fragment = ovcs.fragments[index];
        let target = Target {
            node: fragment.target,
            in_livetree: true,
        };
        if let Err(e) = build_changeset_next_level(tree, ovcs, target, fragment.overlay) {
            debug!("fragment apply failed '{}'", tree.path(fragment.target));
            return Err(e);
        }
    }

    if ovcs.symbols_fragment {
        let fragment = *ovcs.fragments.last().expect("symbols fragment is present");
        let target = Target {
            node: fragment.target,
            in_livetree: true,
        };
        if let Err(e) = build_changeset_symbols_node(tree, ovcs, target, fragment.overlay) {
            debug!("symbols fragment apply failed '{}'", tree.path(fragment.target));
            return Err(e);
        }
    }

    changeset_dup_entry_check(tree, &ovcs.cset)
}

/// Adds the properties and children of `overlay_node` at one level of the
/// walk, recursing into children.
fn build_changeset_next_level(
    tree: &mut LiveTree,
    ovcs: &mut OverlayChangeset,
    target: Target,
    overlay_node: NodeId,
) -> Result<(), OverlayError> {
    {
        let tree_ref: &LiveTree = tree;
        for prop in tree_ref.properties(overlay_node) {
            if let Err(e) = add_changeset_property(tree_ref, ovcs, target, prop, false) {
                debug!(
                    "Failed to apply prop @{}/{}, err={}",
                    tree_ref.path(target.node),
                    prop.name(),
                    e
                );
                return Err(e);
            }
        }
    }

    let children: Vec<NodeId> = tree.children(overlay_node).collect();
    for child in children {
        if let Err(e) = add_changeset_node(tree, ovcs, target, child) {
            debug!(
                "Failed to apply node @{}/{}, err={}",
                tree.path(target.node),
                basename(tree.name(child)),
                e
            );
            return Err(e);
        }
    }

    Ok(())
}

/// Adds the properties of the `__symbols__` node.  Symbols nodes have no
/// children.
fn build_changeset_symbols_node(
    tree: &mut LiveTree,
    ovcs: &mut OverlayChangeset,
    target: Target,
    overlay_symbols_node: NodeId,
) -> Result<(), OverlayError> {
    let tree_ref: &LiveTree = tree;
    for prop in tree_ref.properties(overlay_symbols_node) {
        if let Err(e) = add_changeset_property(tree_ref, ovcs, target, prop, true) {
            debug!(
                "Failed to apply symbols prop @{}/{}, err={}",
                tree_ref.path(target.node),
                prop.name(),
                e
            );
            return Err(e);
        }
    }
    Ok(())
}

/// Adds one overlay property to the changeset: an update if the live target
/// already has it, an add otherwise.
///
/// Some special properties are not added or updated: `name`, `phandle`,
/// `linux,phandle`.  `#address-cells` and `#size-cells` are never updated,
/// but if present in the live tree the overlay's values must match.
/// Updating a property of the symbols node is not allowed.
fn add_changeset_property(
    tree: &LiveTree,
    ovcs: &mut OverlayChangeset,
    target: Target,
    overlay_prop: &Property,
    is_symbols_prop: bool,
) -> Result<(), OverlayError> {
    if target.in_livetree && is_pseudo_property(overlay_prop.name()) {
        return Ok(());
    }

    let prop = if target.in_livetree {
        tree.property(target.node, overlay_prop.name())
    } else {
        None
    };

    if let Some(prop) = prop {
        if matches!(prop.name(), "#address-cells" | "#size-cells") {
            if prop.value() != overlay_prop.value() {
                error!(
                    "ERROR: changing value of {} is not allowed in {}",
                    prop.name(),
                    tree.path(target.node)
                );
                return Err(OverlayError::new(
                    OverlayErrorKind::CellsMismatch,
                    tree.path(target.node),
                ));
            }
            return Ok(());
        }
    }

    let new_prop = if is_symbols_prop {
        if prop.is_some() {
            return Err(OverlayError::new(
                OverlayErrorKind::SymbolsUpdate,
                tree.path(target.node),
            ));
        }
        dup_and_fixup_symbol_prop(tree, &ovcs.fragments, ovcs.overlay_root, overlay_prop)?
    } else {
        overlay_prop.clone()
    };
    let prop_name = String::from(new_prop.name());

    if prop.is_none() {
        ovcs.cset.add_property(target.node, new_prop);
    } else {
        ovcs.cset.update_property(target.node, new_prop);
    }

    if !tree.flags(target.node).contains(NodeFlags::OVERLAY) {
        warn!(
            "WARNING: memory leak will occur if overlay removed, property: {}/{}",
            tree.path(target.node),
            prop_name
        );
    }

    Ok(())
}

/// Adds one overlay node (and its subtree) to the changeset.
///
/// The live target's children are matched by basename, so that an overlay
/// unflattened from an FDT can apply to a live tree created from Open
/// Firmware, whose node names may carry the full path.
///
/// If the node already exists in the live tree and both sides declare a
/// phandle, the overlay is invalid.
fn add_changeset_node(
    tree: &mut LiveTree,
    ovcs: &mut OverlayChangeset,
    target: Target,
    node: NodeId,
) -> Result<(), OverlayError> {
    let node_basename = basename(tree.name(node)).to_string();

    let tchild = tree
        .children(target.node)
        .find(|&c| basename(tree.name(c)) == node_basename);

    let Some(tchild) = tchild else {
        let device_name = tree
            .property(node, "name")
            .and_then(|p| p.as_str().ok())
            .unwrap_or("<NULL>")
            .to_string();
        // ignore obsolete "linux,phandle"
        let phandle = tree
            .property(node, "phandle")
            .and_then(|p| p.as_u32().ok());

        let tchild = tree.alloc_detached(&node_basename, target.node, NodeFlags::OVERLAY);
        tree.set_device_name(tchild, device_name);
        if phandle.is_some() {
            tree.set_phandle(tchild, phandle);
        }

        ovcs.cset.attach_node(tchild);

        let target_child = Target {
            node: tchild,
            in_livetree: false,
        };
        return build_changeset_next_level(tree, ovcs, target_child, node);
    };

    if tree.phandle(node).is_some() && tree.phandle(tchild).is_some() {
        return Err(OverlayError::new(
            OverlayErrorKind::PhandleCollision,
            tree.path(tchild),
        ));
    }

    let target_child = Target {
        node: tchild,
        in_livetree: target.in_livetree,
    };
    build_changeset_next_level(tree, ovcs, target_child, node)
}

/// Duplicates a symbols-table property, rewriting its overlay-internal path
/// into the live-tree path it will occupy after the apply.
///
/// The value refers to a node in the subtree of a fragment's `__overlay__`
/// node, for example `/fragment@0/__overlay__/symbol_path_tail`.  The
/// `/fragment_name/__overlay__` portion is replaced with the fragment's
/// target path.
fn dup_and_fixup_symbol_prop(
    tree: &LiveTree,
    fragments: &[Fragment],
    overlay_root: NodeId,
    prop: &Property,
) -> Result<Property, OverlayError> {
    let fail = || OverlayError::new(OverlayErrorKind::BadSymbolPath, prop.name());

    let path = prop.as_str().map_err(|()| fail())?;
    if path.is_empty() {
        return Err(fail());
    }

    let fragment_name = path
        .trim_start_matches('/')
        .split('/')
        .next()
        .ok_or_else(fail)?;
    let fragment_node = tree.child(overlay_root, fragment_name).ok_or_else(fail)?;
    let overlay_node = tree.child(fragment_node, "__overlay__").ok_or_else(fail)?;

    let fragment = fragments
        .iter()
        .find(|fragment| fragment.overlay == overlay_node)
        .ok_or_else(fail)?;

    let overlay_name = tree.path(overlay_node);
    if overlay_name.len() > path.len() {
        return Err(fail());
    }
    let path_tail = &path[overlay_name.len()..];

    let target_path = tree.path(fragment.target);

    let mut value = Vec::with_capacity(target_path.len() + path_tail.len() + 1);
    value.extend_from_slice(target_path.as_bytes());
    value.extend_from_slice(path_tail.as_bytes());
    value.push(0);

    Ok(Property::new(prop.name(), value))
}

/// Checks the changeset for multiple attach/detach entries for the same
/// node, or multiple property entries for the same property of the same
/// node.  The scan is pairwise; changesets are small in practice.
fn changeset_dup_entry_check(tree: &LiveTree, cset: &Changeset) -> Result<(), OverlayError> {
    let entries = cset.entries();
    for (index, entry) in entries.iter().enumerate() {
        for other in &entries[index + 1..] {
            if entry.is_node_edit() != other.is_node_edit() {
                continue;
            }
            if tree.path(entry.node()) != tree.path(other.node()) {
                continue;
            }
            if entry.is_node_edit() {
                error!(
                    "ERROR: multiple fragments add and/or delete node {}",
                    tree.path(entry.node())
                );
                return Err(OverlayError::new(
                    OverlayErrorKind::DuplicateEdit,
                    tree.path(entry.node()),
                ));
            }
            if entry.property_name() == other.property_name() {
                error!(
                    "ERROR: multiple fragments add, update, and/or delete property {}/{}",
                    tree.path(entry.node()),
                    entry.property_name().unwrap_or("<unknown>")
                );
                return Err(OverlayError::new(
                    OverlayErrorKind::DuplicateEdit,
                    tree.path(entry.node()),
                ));
            }
        }
    }
    Ok(())
}
