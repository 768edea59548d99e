// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

mod common;

use common::{snapshot, to_blob};
use dt_overlay::overlay::ErrorClass;
use dt_overlay::tree::{LiveTree, Property};
use dt_overlay::OverlayManager;

fn property_overlay(target_path: &str, name: &str, value: &str) -> Vec<u8> {
    let mut overlay = LiveTree::new();
    let fragment = overlay.add_child(overlay.root(), "fragment@0").unwrap();
    overlay.add_property(fragment, Property::from_str("target-path", target_path));
    let content = overlay.add_child(fragment, "__overlay__").unwrap();
    overlay.add_property(content, Property::from_str(name, value));
    to_blob(&overlay)
}

fn subtree_overlay(target_path: &str, node_name: &str) -> Vec<u8> {
    let mut overlay = LiveTree::new();
    let fragment = overlay.add_child(overlay.root(), "fragment@0").unwrap();
    overlay.add_property(fragment, Property::from_str("target-path", target_path));
    let content = overlay.add_child(fragment, "__overlay__").unwrap();
    let node = overlay.add_child(content, node_name).unwrap();
    overlay.add_property(node, Property::from_str("compatible", "x"));
    to_blob(&overlay)
}

#[test]
fn non_topmost_removal_is_refused() {
    let mut live = LiveTree::new();
    live.add_child(live.root(), "bus").unwrap();
    let manager = OverlayManager::new(live);
    let before = snapshot(&manager);

    let o1 = manager
        .apply_fdt(&property_overlay("/bus", "p1", "a"), None)
        .unwrap();
    let after_o1 = snapshot(&manager);
    let o2 = manager
        .apply_fdt(&property_overlay("/bus", "p2", "b"), None)
        .unwrap();
    let after_o2 = snapshot(&manager);

    // Both overlays touch /bus, so the earlier one is not removable.
    let err = manager.remove(o1).unwrap_err();
    assert_eq!(err.class(), ErrorClass::Busy);
    assert_eq!(snapshot(&manager), after_o2);
    assert_eq!(manager.applied_overlays(), vec![o1, o2]);

    manager.remove(o2).unwrap();
    assert_eq!(snapshot(&manager), after_o1);
    manager.remove(o1).unwrap();
    assert_eq!(snapshot(&manager), before);
}

#[test]
fn overlap_includes_ancestors_and_descendants() {
    let mut live = LiveTree::new();
    live.add_child(live.root(), "bus").unwrap();
    let manager = OverlayManager::new(live);

    // O1 edits /bus itself; O2 creates /bus/dev@0 below it.
    let o1 = manager
        .apply_fdt(&property_overlay("/bus", "p1", "a"), None)
        .unwrap();
    let o2 = manager
        .apply_fdt(&subtree_overlay("/bus", "dev@0"), None)
        .unwrap();

    let err = manager.remove(o1).unwrap_err();
    assert_eq!(err.class(), ErrorClass::Busy);

    manager.remove(o2).unwrap();
    manager.remove(o1).unwrap();
}

#[test]
fn disjoint_overlays_remove_in_any_order() {
    let mut live = LiveTree::new();
    live.add_child(live.root(), "a").unwrap();
    live.add_child(live.root(), "b").unwrap();
    let manager = OverlayManager::new(live);
    let before = snapshot(&manager);

    let o1 = manager
        .apply_fdt(&property_overlay("/a", "p", "1"), None)
        .unwrap();
    let o2 = manager
        .apply_fdt(&property_overlay("/b", "p", "2"), None)
        .unwrap();

    // The overlays touch disjoint subtrees, so O1 is removable first.
    manager.remove(o1).unwrap();
    manager.remove(o2).unwrap();
    assert_eq!(snapshot(&manager), before);
}

#[test]
fn unknown_id_is_reported() {
    let mut live = LiveTree::new();
    live.add_child(live.root(), "a").unwrap();
    let manager = OverlayManager::new(live);

    let id = manager
        .apply_fdt(&property_overlay("/a", "p", "1"), None)
        .unwrap();
    manager.remove(id).unwrap();

    let err = manager.remove(id).unwrap_err();
    assert_eq!(err.class(), ErrorClass::NoDev);
}

#[test]
fn ids_are_unique_and_ordered() {
    let mut live = LiveTree::new();
    live.add_child(live.root(), "a").unwrap();
    live.add_child(live.root(), "b").unwrap();
    live.add_child(live.root(), "c").unwrap();
    let manager = OverlayManager::new(live);

    let o1 = manager
        .apply_fdt(&property_overlay("/a", "p", "1"), None)
        .unwrap();
    let o2 = manager
        .apply_fdt(&property_overlay("/b", "p", "2"), None)
        .unwrap();
    let o3 = manager
        .apply_fdt(&property_overlay("/c", "p", "3"), None)
        .unwrap();

    assert!(o1.get() > 0);
    assert!(o1.get() < o2.get());
    assert!(o2.get() < o3.get());
    assert_eq!(manager.applied_overlays(), vec![o1, o2, o3]);
}

#[test]
fn remove_all_unwinds_newest_first() {
    let mut live = LiveTree::new();
    live.add_child(live.root(), "bus").unwrap();
    let manager = OverlayManager::new(live);
    let before = snapshot(&manager);

    // Stacked overlays on the same node: only tail-first removal works, so
    // remove_all must unwind from the newest.
    manager
        .apply_fdt(&property_overlay("/bus", "p1", "a"), None)
        .unwrap();
    manager
        .apply_fdt(&property_overlay("/bus", "p2", "b"), None)
        .unwrap();
    manager
        .apply_fdt(&property_overlay("/bus", "p3", "c"), None)
        .unwrap();

    manager.remove_all().unwrap();
    assert!(manager.applied_overlays().is_empty());
    assert_eq!(snapshot(&manager), before);
}

#[test]
fn failed_apply_leaves_registry_unchanged() {
    let mut live = LiveTree::new();
    live.add_child(live.root(), "a").unwrap();
    let manager = OverlayManager::new(live);

    let o1 = manager
        .apply_fdt(&property_overlay("/a", "p", "1"), None)
        .unwrap();
    manager
        .apply_fdt(&property_overlay("/missing", "p", "2"), None)
        .unwrap_err();

    assert_eq!(manager.applied_overlays(), vec![o1]);
}
