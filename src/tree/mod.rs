// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The live devicetree.
//!
//! Nodes live in an arena owned by [`LiveTree`] and are addressed by
//! [`NodeId`] handles.  A node's `parent` is a non-owning back-reference;
//! the forward links are each node's ordered children table.  Unflattened
//! overlay trees share the arena as detached subtrees, so the overlay engine
//! can pair overlay nodes against live nodes without a second node type.
//!
//! Children and properties are stored in [`indexmap::IndexMap`]s, which
//! provide O(1) lookups by name while preserving insertion order.

mod node;
mod property;

use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::fmt;

use crate::error::FdtError;
use crate::fdt::{Fdt, FdtNode};
use crate::writer;

use node::NodeData;
pub use node::NodeFlags;
pub use property::Property;

/// A handle to a node in a [`LiveTree`] arena.
///
/// Handles stay valid until the node is freed by the overlay engine;
/// holding a handle does not keep the node alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

/// An error that can occur when mutating the live tree.
#[derive(Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum TreeError {
    /// A child with the same name already exists under the parent.
    NodeExists,
    /// The node is already linked into its parent.
    AlreadyAttached,
    /// The node is not linked into its parent.
    NotAttached,
    /// The node has no parent to link into.
    NoParent,
    /// The named property does not exist on the node.
    PropertyMissing,
    /// A property with the same name already exists on the node.
    PropertyExists,
}

impl fmt::Display for TreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TreeError::NodeExists => write!(f, "a child with the same name already exists"),
            TreeError::AlreadyAttached => write!(f, "node is already attached"),
            TreeError::NotAttached => write!(f, "node is not attached"),
            TreeError::NoParent => write!(f, "node has no parent"),
            TreeError::PropertyMissing => write!(f, "no such property"),
            TreeError::PropertyExists => write!(f, "property already exists"),
        }
    }
}

impl core::error::Error for TreeError {}

/// The names that are node metadata rather than real properties.
pub(crate) fn is_pseudo_property(name: &str) -> bool {
    matches!(name, "name" | "phandle" | "linux,phandle")
}

/// Returns the final path component of a possibly-full node name.
///
/// Live trees created from Open Firmware may carry the full path in the node
/// name; trees unflattened from an FDT carry only the basename.
pub(crate) fn basename(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

/// A live devicetree: an arena of nodes plus the root handle.
///
/// # Examples
///
/// ```
/// # use dt_overlay::tree::{LiveTree, Property};
/// let mut tree = LiveTree::new();
/// let bus = tree.add_child(tree.root(), "bus").unwrap();
/// tree.add_property(bus, Property::from_str("compatible", "simple-bus"));
/// assert_eq!(tree.path(bus), "/bus");
/// ```
#[derive(Debug)]
pub struct LiveTree {
    nodes: Vec<Option<NodeData>>,
    free: Vec<usize>,
    root: NodeId,
}

impl Default for LiveTree {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveTree {
    /// Creates a new tree holding only a root node.
    #[must_use]
    pub fn new() -> Self {
        let root = NodeData::new("", None, NodeFlags::empty());
        Self {
            nodes: alloc::vec![Some(root)],
            free: Vec::new(),
            root: NodeId(0),
        }
    }

    /// Creates a new tree from a flattened device tree blob.
    ///
    /// # Errors
    ///
    /// Returns an error if the blob structure cannot be walked.
    pub fn from_fdt(fdt: &Fdt<'_>) -> Result<Self, FdtError> {
        let mut tree = Self::new();
        let root = tree.root;
        tree.populate_node(root, fdt.root()?, NodeFlags::empty())?;
        Ok(tree)
    }

    /// Returns the root node of the tree.
    #[must_use]
    pub fn root(&self) -> NodeId {
        self.root
    }

    fn node(&self, id: NodeId) -> &NodeData {
        self.nodes[id.0].as_ref().expect("stale node id")
    }

    fn node_mut(&mut self, id: NodeId) -> &mut NodeData {
        self.nodes[id.0].as_mut().expect("stale node id")
    }

    /// Returns the name of a node (its path component).
    #[must_use]
    pub fn name(&self, id: NodeId) -> &str {
        &self.node(id).name
    }

    /// Returns the value of the legacy `name` property recorded for a node.
    #[must_use]
    pub fn device_name(&self, id: NodeId) -> &str {
        &self.node(id).device_name
    }

    /// Returns a node's parent, if it has one.
    #[must_use]
    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).parent
    }

    /// Returns a node's phandle, if it has one.
    #[must_use]
    pub fn phandle(&self, id: NodeId) -> Option<u32> {
        self.node(id).phandle
    }

    /// Returns the flags of a node.
    #[must_use]
    pub fn flags(&self, id: NodeId) -> NodeFlags {
        self.node(id).flags
    }

    pub(crate) fn set_phandle(&mut self, id: NodeId, phandle: Option<u32>) {
        self.node_mut(id).phandle = phandle;
    }

    pub(crate) fn set_device_name(&mut self, id: NodeId, device_name: impl Into<String>) {
        self.node_mut(id).device_name = device_name.into();
    }

    /// Returns an iterator over the linked children of a node.
    pub fn children(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.node(id).children.values().copied()
    }

    /// Finds a linked child by its exact name.
    ///
    /// # Performance
    ///
    /// This is a constant-time operation.
    #[must_use]
    pub fn child(&self, id: NodeId, name: &str) -> Option<NodeId> {
        self.node(id).children.get(name).copied()
    }

    /// Returns an iterator over the properties of a node.
    pub fn properties(&self, id: NodeId) -> impl Iterator<Item = &Property> {
        self.node(id).properties.values()
    }

    /// Finds a property by its name.
    ///
    /// # Performance
    ///
    /// This is a constant-time operation.
    #[must_use]
    pub fn property(&self, id: NodeId, name: &str) -> Option<&Property> {
        self.node(id).properties.get(name)
    }

    /// Finds a property by its name and returns a mutable reference to it.
    #[must_use]
    pub fn property_mut(&mut self, id: NodeId, name: &str) -> Option<&mut Property> {
        self.node_mut(id).properties.get_mut(name)
    }

    /// Adds a property to a node, replacing any existing property with the
    /// same name.
    ///
    /// A `phandle` or `linux,phandle` property also updates the node's
    /// phandle.
    pub fn add_property(&mut self, id: NodeId, property: Property) {
        self.put_property(id, property);
    }

    /// Inserts a property, returning the previous property with the same
    /// name if there was one.
    pub(crate) fn put_property(&mut self, id: NodeId, property: Property) -> Option<Property> {
        if matches!(property.name(), "phandle" | "linux,phandle") {
            self.node_mut(id).phandle = property.as_u32().ok();
        }
        let node = self.node_mut(id);
        node.properties.insert(property.name().to_string(), property)
    }

    /// Removes a property from a node by its name.
    ///
    /// # Performance
    ///
    /// This is a linear-time operation, as it needs to shift elements after
    /// the removed property.
    pub fn remove_property(&mut self, id: NodeId, name: &str) -> Option<Property> {
        let removed = self.node_mut(id).properties.shift_remove(name)?;
        if matches!(name, "phandle" | "linux,phandle") {
            let other = match name {
                "phandle" => "linux,phandle",
                _ => "phandle",
            };
            let phandle = self.property(id, other).and_then(|p| p.as_u32().ok());
            self.node_mut(id).phandle = phandle;
        }
        Some(removed)
    }

    /// Creates a new node and links it under `parent`.
    ///
    /// # Errors
    ///
    /// Returns [`TreeError::NodeExists`] if `parent` already has a child of
    /// the same name.
    pub fn add_child(&mut self, parent: NodeId, name: &str) -> Result<NodeId, TreeError> {
        let id = self.alloc_detached(name, parent, NodeFlags::empty());
        self.attach(id)?;
        Ok(id)
    }

    /// Allocates a new detached node with a recorded parent.
    ///
    /// The node is not linked into `parent` until [`attach`](Self::attach)
    /// runs.
    pub(crate) fn alloc_detached(
        &mut self,
        name: &str,
        parent: NodeId,
        extra_flags: NodeFlags,
    ) -> NodeId {
        let data = NodeData::new(
            name,
            Some(parent),
            NodeFlags::DYNAMIC | NodeFlags::DETACHED | extra_flags,
        );
        self.insert_slot(data)
    }

    fn insert_slot(&mut self, data: NodeData) -> NodeId {
        if let Some(index) = self.free.pop() {
            self.nodes[index] = Some(data);
            NodeId(index)
        } else {
            self.nodes.push(Some(data));
            NodeId(self.nodes.len() - 1)
        }
    }

    /// Links a detached node into its parent's children.
    pub(crate) fn attach(&mut self, id: NodeId) -> Result<(), TreeError> {
        if !self.node(id).flags.contains(NodeFlags::DETACHED) {
            return Err(TreeError::AlreadyAttached);
        }
        let parent = self.node(id).parent.ok_or(TreeError::NoParent)?;
        let name = self.node(id).name.clone();
        if self.node(parent).children.contains_key(&name) {
            return Err(TreeError::NodeExists);
        }
        self.node_mut(parent).children.insert(name, id);
        self.node_mut(id).flags.remove(NodeFlags::DETACHED);
        Ok(())
    }

    /// Unlinks a node from its parent's children.
    pub(crate) fn detach(&mut self, id: NodeId) -> Result<(), TreeError> {
        if self.node(id).flags.contains(NodeFlags::DETACHED) {
            return Err(TreeError::NotAttached);
        }
        let parent = self.node(id).parent.ok_or(TreeError::NoParent)?;
        let name = self.node(id).name.clone();
        self.node_mut(parent).children.shift_remove(&name);
        self.node_mut(id).flags.insert(NodeFlags::DETACHED);
        Ok(())
    }

    /// Frees a single node slot.  The node must be unlinked.
    pub(crate) fn free(&mut self, id: NodeId) {
        debug_assert!(self.node(id).flags.contains(NodeFlags::DETACHED));
        self.nodes[id.0] = None;
        self.free.push(id.0);
    }

    /// Frees a detached subtree rooted at `id`, children first.
    pub(crate) fn free_subtree(&mut self, id: NodeId) {
        let children: Vec<NodeId> = self.children(id).collect();
        for child in children {
            self.free_subtree(child);
        }
        self.nodes[id.0] = None;
        self.free.push(id.0);
    }

    /// Returns the full path of a node, `/` for the root of its tree.
    #[must_use]
    pub fn path(&self, id: NodeId) -> String {
        let mut components: Vec<&str> = Vec::new();
        let mut current = id;
        while let Some(parent) = self.node(current).parent {
            components.push(basename(&self.node(current).name));
            current = parent;
        }
        if components.is_empty() {
            return String::from("/");
        }
        let mut path = String::new();
        for component in components.iter().rev() {
            path.push('/');
            path.push_str(component);
        }
        path
    }

    /// Resolves a path relative to `base`; a leading `/` is ignored.
    ///
    /// # Performance
    ///
    /// Performance is linear in the number of path segments, as child lookup
    /// is a constant-time operation.
    #[must_use]
    pub fn find_node(&self, base: NodeId, path: &str) -> Option<NodeId> {
        let mut current = base;
        for component in path.split('/').filter(|s| !s.is_empty()) {
            current = self.child(current, component)?;
        }
        Some(current)
    }

    /// Finds a node by its absolute path in the live tree.
    #[must_use]
    pub fn find_by_path(&self, path: &str) -> Option<NodeId> {
        if !path.starts_with('/') {
            return None;
        }
        self.find_node(self.root, path)
    }

    /// Finds a node reachable from the root by its phandle.
    #[must_use]
    pub fn find_by_phandle(&self, phandle: u32) -> Option<NodeId> {
        self.find_phandle_in(self.root, phandle)
    }

    fn find_phandle_in(&self, id: NodeId, phandle: u32) -> Option<NodeId> {
        if self.node(id).phandle == Some(phandle) {
            return Some(id);
        }
        for child in self.node(id).children.values() {
            if let Some(found) = self.find_phandle_in(*child, phandle) {
                return Some(found);
            }
        }
        None
    }

    /// Returns the largest phandle reachable from the root.
    #[must_use]
    pub fn max_phandle(&self) -> u32 {
        self.max_phandle_in(self.root)
    }

    fn max_phandle_in(&self, id: NodeId) -> u32 {
        let mut max = self.node(id).phandle.unwrap_or(0);
        for child in self.node(id).children.values() {
            max = max.max(self.max_phandle_in(*child));
        }
        max
    }

    /// Returns whether `node` is `tree_node` or one of its descendants,
    /// walking parent links rather than comparing path strings.
    pub(crate) fn subtree_contains(&self, tree_node: NodeId, node: NodeId) -> bool {
        let mut current = Some(node);
        while let Some(id) = current {
            if id == tree_node {
                return true;
            }
            current = self.node(id).parent;
        }
        false
    }

    /// Unflattens an FDT blob into a detached subtree and returns its root.
    ///
    /// Every node of the subtree is flagged `DYNAMIC`, the subtree root also
    /// `DETACHED`.
    pub(crate) fn unflatten(&mut self, fdt: &Fdt<'_>) -> Result<NodeId, FdtError> {
        let fdt_root = fdt.root()?;
        let data = NodeData::new(
            fdt_root.name()?,
            None,
            NodeFlags::DYNAMIC | NodeFlags::DETACHED,
        );
        let id = self.insert_slot(data);
        if let Err(e) = self.populate_node(id, fdt_root, NodeFlags::DYNAMIC) {
            self.free_subtree(id);
            return Err(e);
        }
        Ok(id)
    }

    /// Copies properties and children of `fdt_node` onto the existing node
    /// `id`.  New descendants get `child_flags`.
    fn populate_node(
        &mut self,
        id: NodeId,
        fdt_node: FdtNode<'_>,
        child_flags: NodeFlags,
    ) -> Result<(), FdtError> {
        for property in fdt_node.properties() {
            let property = property?;
            self.put_property(id, Property::new(property.name(), property.value()));
        }
        if let Some(name_prop) = self.property(id, "name") {
            if let Ok(device_name) = name_prop.as_str() {
                let device_name = device_name.to_string();
                self.set_device_name(id, device_name);
            }
        }
        for child in fdt_node.children() {
            let child = child?;
            let child_data = NodeData::new(child.name()?, Some(id), child_flags);
            let child_id = self.insert_slot(child_data);
            let key = self.node(child_id).name.clone();
            self.node_mut(id).children.insert(key, child_id);
            self.populate_node(child_id, child, child_flags)?;
        }
        Ok(())
    }
}

impl fmt::Display for LiveTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dtb = writer::to_dtb(self, self.root);
        let fdt = Fdt::new(&dtb).map_err(|_| fmt::Error)?;
        fmt::Display::fmt(&fdt, f)
    }
}
