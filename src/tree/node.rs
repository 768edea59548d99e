// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use alloc::string::String;
use bitflags::bitflags;
use indexmap::IndexMap;
use twox_hash::xxhash64;

use super::property::Property;
use super::NodeId;

bitflags! {
    /// Status flags of a live tree node.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NodeFlags: u8 {
        /// The node was created at runtime rather than unflattened from the
        /// base tree.
        const DYNAMIC = 1 << 0;
        /// The node is not linked into its parent's children.
        const DETACHED = 1 << 1;
        /// The node was created by an overlay.
        const OVERLAY = 1 << 2;
    }
}

/// Backing storage of a single node slot in the arena.
///
/// `parent` is a non-owning back-reference; the arena owns every node and
/// `children` holds the forward links.  A node whose `DETACHED` flag is set
/// has a parent recorded but is absent from that parent's `children`.
#[derive(Debug)]
pub(super) struct NodeData {
    pub(super) name: String,
    pub(super) device_name: String,
    pub(super) parent: Option<NodeId>,
    pub(super) children: IndexMap<String, NodeId, xxhash64::State>,
    pub(super) properties: IndexMap<String, Property, xxhash64::State>,
    pub(super) phandle: Option<u32>,
    pub(super) flags: NodeFlags,
}

impl NodeData {
    pub(super) fn new(name: impl Into<String>, parent: Option<NodeId>, flags: NodeFlags) -> Self {
        Self {
            name: name.into(),
            device_name: String::from("<NULL>"),
            parent,
            children: IndexMap::with_hasher(xxhash64::State::with_seed(0xdead_cafe)),
            properties: IndexMap::with_hasher(xxhash64::State::with_seed(0xdead_cafe)),
            phandle: None,
            flags,
        }
    }
}
