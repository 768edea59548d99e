// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Phandle resolution for unflattened overlay trees.
//!
//! Before an overlay can be merged, its phandles must not collide with the
//! live tree and its unresolved references must be rewritten:
//!
//! 1. every phandle declared in the overlay is shifted above the live
//!    tree's current maximum;
//! 2. `/__local_fixups__` describes where the overlay references its own
//!    phandles; those references are shifted by the same delta;
//! 3. `/__fixups__` describes where the overlay references labels of the
//!    live tree; each entry is resolved through the live `/__symbols__`
//!    table and patched with the concrete phandle.

use alloc::string::String;
use alloc::vec::Vec;

use log::error;

use crate::overlay::{OverlayError, OverlayErrorKind};
use crate::tree::{LiveTree, NodeId};

/// Resolves all phandles of the overlay subtree rooted at `overlay_root`
/// against `tree`.
///
/// # Errors
///
/// Returns an error if a fixup table is malformed or refers to a symbol the
/// live tree does not define.
pub fn resolve(tree: &mut LiveTree, overlay_root: NodeId) -> Result<(), OverlayError> {
    let delta = tree.max_phandle();

    adjust_overlay_phandles(tree, overlay_root, delta);

    if let Some(local_fixups) = tree.child(overlay_root, "__local_fixups__") {
        adjust_local_references(tree, local_fixups, overlay_root, delta)?;
    }

    if let Some(fixups) = tree.child(overlay_root, "__fixups__") {
        apply_global_fixups(tree, fixups, overlay_root)?;
    }

    Ok(())
}

/// Shifts every phandle declared in the overlay subtree by `delta`.
fn adjust_overlay_phandles(tree: &mut LiveTree, node: NodeId, delta: u32) {
    if let Some(phandle) = tree.phandle(node) {
        if phandle != 0 {
            let shifted = phandle + delta;
            tree.set_phandle(node, Some(shifted));
            for name in ["phandle", "linux,phandle"] {
                if let Some(prop) = tree.property_mut(node, name) {
                    prop.set_value(shifted.to_be_bytes());
                }
            }
        }
    }

    let children: Vec<NodeId> = tree.children(node).collect();
    for child in children {
        adjust_overlay_phandles(tree, child, delta);
    }
}

/// Walks `/__local_fixups__`, which mirrors the overlay structure, and adds
/// `delta` to each referenced phandle cell of the corresponding overlay
/// property.
fn adjust_local_references(
    tree: &mut LiveTree,
    fixup_node: NodeId,
    overlay_node: NodeId,
    delta: u32,
) -> Result<(), OverlayError> {
    let fixup_props: Vec<(String, Vec<u8>)> = tree
        .properties(fixup_node)
        .filter(|p| p.name() != "name")
        .map(|p| (String::from(p.name()), p.value().to_vec()))
        .collect();

    for (name, offsets) in fixup_props {
        let offsets = decode_offsets(&offsets)
            .map_err(|()| OverlayError::new(OverlayErrorKind::BadFixup, name.clone()))?;
        for offset in offsets {
            let prop = tree.property_mut(overlay_node, &name).ok_or_else(|| {
                OverlayError::new(OverlayErrorKind::BadFixup, name.clone())
            })?;
            patch_phandle_cell(prop.value_mut(), offset, |phandle| phandle + delta)
                .map_err(|()| OverlayError::new(OverlayErrorKind::BadFixup, name.clone()))?;
        }
    }

    let fixup_children: Vec<NodeId> = tree.children(fixup_node).collect();
    for fixup_child in fixup_children {
        let child_name = String::from(tree.name(fixup_child));
        let overlay_child = tree.child(overlay_node, &child_name).ok_or_else(|| {
            OverlayError::new(OverlayErrorKind::BadFixup, child_name.clone())
        })?;
        adjust_local_references(tree, fixup_child, overlay_child, delta)?;
    }

    Ok(())
}

/// Resolves `/__fixups__` entries through the live `/__symbols__` table.
///
/// Each property is named after a label and holds a string list of
/// `<path>:<property>:<offset>` entries naming the overlay cells to patch.
fn apply_global_fixups(
    tree: &mut LiveTree,
    fixups: NodeId,
    overlay_root: NodeId,
) -> Result<(), OverlayError> {
    let symbols = tree.find_by_path("/__symbols__");

    let entries: Vec<(String, Vec<u8>)> = tree
        .properties(fixups)
        .filter(|p| p.name() != "name")
        .map(|p| (String::from(p.name()), p.value().to_vec()))
        .collect();

    for (symbol, value) in entries {
        let phandle = symbols
            .and_then(|s| tree.property(s, &symbol))
            .and_then(|p| p.as_str().ok())
            .and_then(|path| tree.find_by_path(path))
            .and_then(|node| tree.phandle(node))
            .ok_or_else(|| {
                error!("overlay phandle fixup: symbol `{symbol}` not found in live tree");
                OverlayError::new(OverlayErrorKind::UnresolvedSymbol, symbol.clone())
            })?;

        for entry in string_list(&value) {
            let entry = entry
                .map_err(|()| OverlayError::new(OverlayErrorKind::BadFixup, symbol.clone()))?;
            apply_fixup_entry(tree, overlay_root, entry, phandle)
                .ok_or_else(|| OverlayError::new(OverlayErrorKind::BadFixup, entry))?;
        }
    }

    Ok(())
}

/// Patches one `<path>:<property>:<offset>` entry with `phandle`.
fn apply_fixup_entry(
    tree: &mut LiveTree,
    overlay_root: NodeId,
    entry: &str,
    phandle: u32,
) -> Option<()> {
    let mut parts = entry.splitn(3, ':');
    let path = parts.next()?;
    let prop_name = parts.next()?;
    let offset: usize = parts.next()?.parse().ok()?;

    let node = tree.find_node(overlay_root, path)?;
    let prop = tree.property_mut(node, prop_name)?;
    patch_phandle_cell(prop.value_mut(), offset, |_| phandle).ok()
}

/// Rewrites the big-endian u32 cell at `offset` of `value`.
fn patch_phandle_cell(
    value: &mut [u8],
    offset: usize,
    rewrite: impl FnOnce(u32) -> u32,
) -> Result<(), ()> {
    let cell = value.get_mut(offset..offset + 4).ok_or(())?;
    let current = u32::from_be_bytes((&*cell).try_into().map_err(|_| ())?);
    cell.copy_from_slice(&rewrite(current).to_be_bytes());
    Ok(())
}

/// Decodes a `__local_fixups__` property value: an array of big-endian u32
/// byte offsets.
fn decode_offsets(value: &[u8]) -> Result<Vec<usize>, ()> {
    if !value.len().is_multiple_of(4) {
        return Err(());
    }
    Ok(value
        .chunks_exact(4)
        .map(|chunk| {
            u32::from_be_bytes(chunk.try_into().expect("chunks_exact yields 4 bytes")) as usize
        })
        .collect())
}

/// Iterates the NUL-separated strings of a property value.
fn string_list(value: &[u8]) -> impl Iterator<Item = Result<&str, ()>> {
    value
        .split(|&b| b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| core::str::from_utf8(s).map_err(|_| ()))
}
