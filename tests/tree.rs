// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use dt_overlay::tree::{LiveTree, Property};

#[test]
fn tree_creation() {
    let mut tree = LiveTree::new();
    let root = tree.root();
    tree.add_property(root, Property::from_str("compatible", "test"));
    tree.add_property(root, Property::new("prop-u32", 1u32.to_be_bytes()));

    let child_a = tree.add_child(root, "child-a").unwrap();
    tree.add_property(child_a, Property::from_str("child-prop", "a"));
    let child_b = tree.add_child(root, "child-b").unwrap();
    tree.add_property(child_b, Property::from_str("child-prop", "b"));

    assert_eq!(tree.name(root), "");
    assert_eq!(tree.properties(root).count(), 2);
    assert_eq!(tree.children(root).count(), 2);

    let child_a = tree.child(root, "child-a").unwrap();
    assert_eq!(tree.property(child_a, "child-prop").unwrap().as_str(), Ok("a"));

    let child_b = tree.child(root, "child-b").unwrap();
    assert_eq!(tree.property(child_b, "child-prop").unwrap().as_str(), Ok("b"));
}

#[test]
fn tree_modification() {
    let mut tree = LiveTree::new();
    let root = tree.root();

    // Add a child
    let child = tree.add_child(root, "child").unwrap();
    assert_eq!(tree.children(root).count(), 1);

    // Add a property to the child
    tree.add_property(child, Property::from_str("prop", "value"));
    assert_eq!(tree.properties(child).count(), 1);

    // Find and modify the property
    let prop = tree.property_mut(child, "prop").unwrap();
    prop.set_value("new-value".as_bytes());
    assert_eq!(
        tree.property(child, "prop").unwrap().value(),
        b"new-value".as_slice()
    );

    // Remove the property
    let removed_prop = tree.remove_property(child, "prop");
    assert!(removed_prop.is_some());
    assert_eq!(tree.properties(child).count(), 0);
}

#[test]
fn duplicate_child_name_is_rejected() {
    let mut tree = LiveTree::new();
    let root = tree.root();
    tree.add_child(root, "child").unwrap();
    assert!(tree.add_child(root, "child").is_err());
}

#[test]
fn paths_and_lookup() {
    let mut tree = LiveTree::new();
    let root = tree.root();
    let child_a = tree.add_child(root, "child-a").unwrap();
    let child_a_a = tree.add_child(child_a, "child-a-a").unwrap();
    tree.add_child(root, "child-b").unwrap();

    assert_eq!(tree.path(root), "/");
    assert_eq!(tree.path(child_a), "/child-a");
    assert_eq!(tree.path(child_a_a), "/child-a/child-a-a");

    assert_eq!(tree.find_by_path("/child-a/child-a-a"), Some(child_a_a));
    assert_eq!(tree.find_by_path("/"), Some(root));
    assert_eq!(tree.find_by_path("/child-a/child-c"), None);
    assert_eq!(tree.find_by_path("relative"), None);

    assert_eq!(tree.parent(child_a_a), Some(child_a));
    assert_eq!(tree.parent(root), None);
}

#[test]
fn phandle_tracks_property() {
    let mut tree = LiveTree::new();
    let node = tree.add_child(tree.root(), "node").unwrap();

    assert_eq!(tree.phandle(node), None);
    tree.add_property(node, Property::new("phandle", 0x10u32.to_be_bytes()));
    assert_eq!(tree.phandle(node), Some(0x10));
    assert_eq!(tree.find_by_phandle(0x10), Some(node));
    assert_eq!(tree.max_phandle(), 0x10);

    tree.remove_property(node, "phandle");
    assert_eq!(tree.phandle(node), None);
    assert_eq!(tree.find_by_phandle(0x10), None);
}

#[test]
fn device_tree_format() {
    let mut tree = LiveTree::new();
    let root = tree.root();
    let child_a = tree.add_child(root, "child-a").unwrap();
    tree.add_child(child_a, "child-a-a").unwrap();
    tree.add_child(root, "child-b").unwrap();

    let fds = tree.to_string();

    assert_eq!(
        fds,
        r#"/dts-v1/;

/ {

    child-a {

        child-a-a {
        };
    };

    child-b {
    };
};
"#
    );
}
