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
use dt_overlay::tree::{LiveTree, NodeFlags, Property};
use dt_overlay::OverlayManager;

/// Builds an overlay blob with a single fragment targeting `target_path`,
/// whose `__overlay__` node is populated by `populate`.
fn fragment_blob(target_path: &str, populate: impl FnOnce(&mut LiveTree, dt_overlay::NodeId)) -> Vec<u8> {
    let mut overlay = LiveTree::new();
    let fragment = overlay.add_child(overlay.root(), "fragment@0").unwrap();
    overlay.add_property(fragment, Property::from_str("target-path", target_path));
    let content = overlay.add_child(fragment, "__overlay__").unwrap();
    populate(&mut overlay, content);
    to_blob(&overlay)
}

#[test]
fn add_property_apply_and_remove() {
    // Live: / { a { p = "x"; }; };
    let mut live = LiveTree::new();
    let a = live.add_child(live.root(), "a").unwrap();
    live.add_property(a, Property::from_str("p", "x"));
    let manager = OverlayManager::new(live);
    let before = snapshot(&manager);

    // Overlay: / { fragment@0 { target-path = "/a"; __overlay__ { q = "y"; }; }; };
    let blob = fragment_blob("/a", |overlay, content| {
        overlay.add_property(content, Property::from_str("q", "y"));
    });

    let id = manager.apply_fdt(&blob, None).unwrap();
    manager.with_tree(|tree| {
        let a = tree.find_by_path("/a").unwrap();
        assert_eq!(tree.property(a, "q").unwrap().as_str(), Ok("y"));
        assert_eq!(tree.property(a, "p").unwrap().as_str(), Ok("x"));
    });

    manager.remove(id).unwrap();
    assert_eq!(snapshot(&manager), before);
    assert!(manager.applied_overlays().is_empty());
}

#[test]
fn update_property_apply_and_remove() {
    let mut live = LiveTree::new();
    let a = live.add_child(live.root(), "a").unwrap();
    live.add_property(a, Property::from_str("p", "x"));
    let manager = OverlayManager::new(live);
    let before = snapshot(&manager);

    let blob = fragment_blob("/a", |overlay, content| {
        overlay.add_property(content, Property::from_str("p", "z"));
    });

    let id = manager.apply_fdt(&blob, None).unwrap();
    manager.with_tree(|tree| {
        let a = tree.find_by_path("/a").unwrap();
        assert_eq!(tree.property(a, "p").unwrap().as_str(), Ok("z"));
    });

    manager.remove(id).unwrap();
    assert_eq!(snapshot(&manager), before);
}

#[test]
fn changing_address_cells_is_rejected() {
    // Live: / { a { #address-cells = <1>; }; };
    let mut live = LiveTree::new();
    let a = live.add_child(live.root(), "a").unwrap();
    live.add_property(a, Property::new("#address-cells", 1u32.to_be_bytes()));
    let manager = OverlayManager::new(live);
    let before = snapshot(&manager);

    let blob = fragment_blob("/a", |overlay, content| {
        overlay.add_property(content, Property::new("#address-cells", 2u32.to_be_bytes()));
    });

    let err = manager.apply_fdt(&blob, None).unwrap_err();
    assert_eq!(err.class(), ErrorClass::Invalid);
    assert_eq!(snapshot(&manager), before);
    assert!(manager.applied_overlays().is_empty());
}

#[test]
fn matching_address_cells_is_allowed() {
    let mut live = LiveTree::new();
    let a = live.add_child(live.root(), "a").unwrap();
    live.add_property(a, Property::new("#address-cells", 1u32.to_be_bytes()));
    let manager = OverlayManager::new(live);
    let before = snapshot(&manager);

    let blob = fragment_blob("/a", |overlay, content| {
        overlay.add_property(content, Property::new("#address-cells", 1u32.to_be_bytes()));
        overlay.add_property(content, Property::from_str("q", "y"));
    });

    let id = manager.apply_fdt(&blob, None).unwrap();
    manager.remove(id).unwrap();
    assert_eq!(snapshot(&manager), before);
}

#[test]
fn new_subtree_is_created_and_removed() {
    // Live: / { bus { }; };
    let mut live = LiveTree::new();
    live.add_child(live.root(), "bus").unwrap();
    let manager = OverlayManager::new(live);
    let before = snapshot(&manager);

    // Overlay creates /bus/dev@0 { compatible = "x"; };
    let blob = fragment_blob("/bus", |overlay, content| {
        let dev = overlay.add_child(content, "dev@0").unwrap();
        overlay.add_property(dev, Property::from_str("compatible", "x"));
    });

    let id = manager.apply_fdt(&blob, None).unwrap();
    manager.with_tree(|tree| {
        let dev = tree.find_by_path("/bus/dev@0").unwrap();
        assert_eq!(tree.property(dev, "compatible").unwrap().as_str(), Ok("x"));
        assert!(tree.flags(dev).contains(NodeFlags::OVERLAY));
        assert!(tree.flags(dev).contains(NodeFlags::DYNAMIC));
    });

    manager.remove(id).unwrap();
    manager.with_tree(|tree| {
        assert!(tree.find_by_path("/bus/dev@0").is_none());
    });
    assert_eq!(snapshot(&manager), before);
}

#[test]
fn symbols_are_fixed_up_to_target_paths() {
    let mut live = LiveTree::new();
    live.add_child(live.root(), "bus").unwrap();
    live.add_child(live.root(), "__symbols__").unwrap();
    let manager = OverlayManager::new(live);
    let before = snapshot(&manager);

    let mut overlay = LiveTree::new();
    let fragment = overlay.add_child(overlay.root(), "fragment@0").unwrap();
    overlay.add_property(fragment, Property::from_str("target-path", "/bus"));
    let content = overlay.add_child(fragment, "__overlay__").unwrap();
    overlay.add_child(content, "dev@0").unwrap();
    let symbols = overlay.add_child(overlay.root(), "__symbols__").unwrap();
    overlay.add_property(
        symbols,
        Property::from_str("s1", "/fragment@0/__overlay__/dev@0"),
    );

    let id = manager.apply_fdt(&to_blob(&overlay), None).unwrap();
    manager.with_tree(|tree| {
        let symbols = tree.find_by_path("/__symbols__").unwrap();
        assert_eq!(tree.property(symbols, "s1").unwrap().as_str(), Ok("/bus/dev@0"));
    });

    manager.remove(id).unwrap();
    assert_eq!(snapshot(&manager), before);
}

#[test]
fn updating_an_existing_symbol_is_rejected() {
    let mut live = LiveTree::new();
    live.add_child(live.root(), "bus").unwrap();
    let symbols = live.add_child(live.root(), "__symbols__").unwrap();
    live.add_property(symbols, Property::from_str("s1", "/elsewhere"));
    let manager = OverlayManager::new(live);
    let before = snapshot(&manager);

    let mut overlay = LiveTree::new();
    let fragment = overlay.add_child(overlay.root(), "fragment@0").unwrap();
    overlay.add_property(fragment, Property::from_str("target-path", "/bus"));
    let content = overlay.add_child(fragment, "__overlay__").unwrap();
    overlay.add_child(content, "dev@0").unwrap();
    let overlay_symbols = overlay.add_child(overlay.root(), "__symbols__").unwrap();
    overlay.add_property(
        overlay_symbols,
        Property::from_str("s1", "/fragment@0/__overlay__/dev@0"),
    );

    let err = manager.apply_fdt(&to_blob(&overlay), None).unwrap_err();
    assert_eq!(err.class(), ErrorClass::Invalid);
    assert_eq!(snapshot(&manager), before);
}

#[test]
fn symbols_in_overlay_but_not_in_live_tree() {
    let mut live = LiveTree::new();
    live.add_child(live.root(), "bus").unwrap();
    let manager = OverlayManager::new(live);

    let mut overlay = LiveTree::new();
    let fragment = overlay.add_child(overlay.root(), "fragment@0").unwrap();
    overlay.add_property(fragment, Property::from_str("target-path", "/bus"));
    let content = overlay.add_child(fragment, "__overlay__").unwrap();
    overlay.add_child(content, "dev@0").unwrap();
    let symbols = overlay.add_child(overlay.root(), "__symbols__").unwrap();
    overlay.add_property(
        symbols,
        Property::from_str("s1", "/fragment@0/__overlay__/dev@0"),
    );

    let err = manager.apply_fdt(&to_blob(&overlay), None).unwrap_err();
    assert_eq!(err.class(), ErrorClass::Invalid);
}

#[test]
fn phandle_collision_is_rejected() {
    // Live node /a has phandle 0x10.
    let mut live = LiveTree::new();
    let a = live.add_child(live.root(), "a").unwrap();
    live.add_property(a, Property::new("phandle", 0x10u32.to_be_bytes()));
    let manager = OverlayManager::new(live);
    let before = snapshot(&manager);

    // Overlay declares a phandle for the same node.
    let blob = fragment_blob("/", |overlay, content| {
        let a = overlay.add_child(content, "a").unwrap();
        overlay.add_property(a, Property::new("phandle", 0x20u32.to_be_bytes()));
    });

    let err = manager.apply_fdt(&blob, None).unwrap_err();
    assert_eq!(err.class(), ErrorClass::Invalid);
    assert_eq!(snapshot(&manager), before);
}

#[test]
fn target_by_phandle() {
    let mut live = LiveTree::new();
    let a = live.add_child(live.root(), "a").unwrap();
    live.add_property(a, Property::new("phandle", 0x10u32.to_be_bytes()));
    let manager = OverlayManager::new(live);

    let mut overlay = LiveTree::new();
    let fragment = overlay.add_child(overlay.root(), "fragment@0").unwrap();
    overlay.add_property(fragment, Property::new("target", 0x10u32.to_be_bytes()));
    let content = overlay.add_child(fragment, "__overlay__").unwrap();
    overlay.add_property(content, Property::from_str("q", "y"));

    let id = manager.apply_fdt(&to_blob(&overlay), None).unwrap();
    manager.with_tree(|tree| {
        let a = tree.find_by_path("/a").unwrap();
        assert_eq!(tree.property(a, "q").unwrap().as_str(), Ok("y"));
    });
    manager.remove(id).unwrap();
}

#[test]
fn target_path_relative_to_base() {
    let mut live = LiveTree::new();
    let bus = live.add_child(live.root(), "bus").unwrap();
    live.add_child(bus, "dev").unwrap();
    let manager = OverlayManager::new(live);

    let blob = fragment_blob("/dev", |overlay, content| {
        overlay.add_property(content, Property::from_str("q", "y"));
    });

    let base = manager.with_tree(|tree| tree.find_by_path("/bus").unwrap());
    let id = manager.apply_fdt(&blob, Some(base)).unwrap();
    manager.with_tree(|tree| {
        let dev = tree.find_by_path("/bus/dev").unwrap();
        assert_eq!(tree.property(dev, "q").unwrap().as_str(), Ok("y"));
    });
    manager.remove(id).unwrap();
}

#[test]
fn missing_target_is_rejected() {
    let mut live = LiveTree::new();
    live.add_child(live.root(), "a").unwrap();
    let manager = OverlayManager::new(live);
    let before = snapshot(&manager);

    let blob = fragment_blob("/no-such-node", |overlay, content| {
        overlay.add_property(content, Property::from_str("q", "y"));
    });

    let err = manager.apply_fdt(&blob, None).unwrap_err();
    assert_eq!(err.class(), ErrorClass::Invalid);
    assert_eq!(snapshot(&manager), before);
}

#[test]
fn fragment_without_target_property_is_rejected() {
    let manager = OverlayManager::new(LiveTree::new());

    let mut overlay = LiveTree::new();
    let fragment = overlay.add_child(overlay.root(), "fragment@0").unwrap();
    overlay.add_child(fragment, "__overlay__").unwrap();

    let err = manager.apply_fdt(&to_blob(&overlay), None).unwrap_err();
    assert_eq!(err.class(), ErrorClass::Invalid);
}

#[test]
fn overlay_without_fragments_is_rejected() {
    let manager = OverlayManager::new(LiveTree::new());

    let overlay = LiveTree::new();
    let err = manager.apply_fdt(&to_blob(&overlay), None).unwrap_err();
    assert_eq!(err.class(), ErrorClass::Invalid);
}

#[test]
fn truncated_blob_is_rejected() {
    let manager = OverlayManager::new(LiveTree::new());

    let blob = fragment_blob("/", |overlay, content| {
        overlay.add_property(content, Property::from_str("q", "y"));
    });
    let err = manager.apply_fdt(&blob[..blob.len() - 8], None).unwrap_err();
    assert_eq!(err.class(), ErrorClass::Invalid);
}

#[test]
fn duplicate_property_edits_are_rejected() {
    let mut live = LiveTree::new();
    live.add_child(live.root(), "a").unwrap();
    let manager = OverlayManager::new(live);
    let before = snapshot(&manager);

    // Two fragments adding the same property to the same node.
    let mut overlay = LiveTree::new();
    for index in 0..2 {
        let fragment = overlay
            .add_child(overlay.root(), &format!("fragment@{index}"))
            .unwrap();
        overlay.add_property(fragment, Property::from_str("target-path", "/a"));
        let content = overlay.add_child(fragment, "__overlay__").unwrap();
        overlay.add_property(content, Property::from_str("q", "y"));
    }

    let err = manager.apply_fdt(&to_blob(&overlay), None).unwrap_err();
    assert_eq!(err.class(), ErrorClass::Invalid);
    assert_eq!(snapshot(&manager), before);
}
