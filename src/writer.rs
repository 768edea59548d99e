// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Serializes a subtree of a [`LiveTree`] to a flattened device tree blob.
//!
//! Overlay inputs and live-tree snapshots round-trip through this writer:
//! tests fabricate overlay blobs from trees built in memory, and the
//! byte-for-byte restore guarantee of overlay removal is checked by
//! flattening the live tree before apply and after remove.

use alloc::borrow::ToOwned;
use alloc::collections::btree_map::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use zerocopy::byteorder::big_endian;
use zerocopy::IntoBytes;

use crate::fdt::layout::{self, Header};
use crate::tree::{LiveTree, NodeId, Property};

/// The structure and strings blocks under construction, with property
/// names interned into the strings block on first use.
#[derive(Default)]
struct Blocks {
    structure: Vec<u8>,
    strings: Vec<u8>,
    interned: BTreeMap<String, u32>,
}

impl Blocks {
    fn token(&mut self, token: u32) {
        self.structure.extend_from_slice(&token.to_be_bytes());
    }

    /// Pads the structure block to the next token boundary.
    fn pad(&mut self) {
        let aligned = layout::align_up(self.structure.len());
        self.structure.resize(aligned, 0);
    }

    /// Returns the strings block offset of `name`, appending it on first
    /// use.
    fn intern(&mut self, name: &str) -> u32 {
        if let Some(&offset) = self.interned.get(name) {
            return offset;
        }
        let offset = u32::try_from(self.strings.len()).expect("strings block exceeds u32");
        self.strings.extend_from_slice(name.as_bytes());
        self.strings.push(0);
        self.interned.insert(name.to_owned(), offset);
        offset
    }

    fn property(&mut self, prop: &Property) {
        let name_offset = self.intern(prop.name());
        let value_len =
            u32::try_from(prop.value().len()).expect("property value length exceeds u32");

        self.token(layout::TOKEN_PROP);
        self.structure.extend_from_slice(&value_len.to_be_bytes());
        self.structure.extend_from_slice(&name_offset.to_be_bytes());
        self.structure.extend_from_slice(prop.value());
        self.pad();
    }

    fn node(&mut self, tree: &LiveTree, id: NodeId, is_root: bool) {
        self.token(layout::TOKEN_BEGIN_NODE);
        // The subtree root flattens with an empty name regardless of its
        // name in the arena.
        if !is_root {
            self.structure.extend_from_slice(tree.name(id).as_bytes());
        }
        self.structure.push(0);
        self.pad();

        for prop in tree.properties(id) {
            self.property(prop);
        }
        for child in tree.children(id) {
            self.node(tree, child, false);
        }

        self.token(layout::TOKEN_END_NODE);
    }
}

/// Flattens the subtree of `tree` rooted at `root` into a DTB blob.
///
/// # Panics
///
/// This may panic if any of the lengths written to the DTB (block sizes,
/// property value length, etc.) exceed [`u32::MAX`].
#[must_use]
pub fn to_dtb(tree: &LiveTree, root: NodeId) -> Vec<u8> {
    let mut blocks = Blocks::default();
    blocks.node(tree, root, true);
    blocks.token(layout::TOKEN_END);

    // Empty memory reservation block: a single terminator entry.
    let rsvmap = [0u8; 16];
    let rsvmap_offset = size_of::<Header>();
    let structure_offset = rsvmap_offset + rsvmap.len();
    let strings_offset = structure_offset + blocks.structure.len();
    let totalsize = strings_offset + blocks.strings.len();

    let header = Header {
        magic: layout::MAGIC.into(),
        totalsize: be32(totalsize),
        off_dt_struct: be32(structure_offset),
        off_dt_strings: be32(strings_offset),
        off_mem_rsvmap: be32(rsvmap_offset),
        version: layout::VERSION.into(),
        last_comp_version: layout::LAST_COMPATIBLE_VERSION.into(),
        boot_cpuid_phys: 0u32.into(),
        size_dt_strings: be32(blocks.strings.len()),
        size_dt_struct: be32(blocks.structure.len()),
    };

    let mut dtb = Vec::with_capacity(totalsize);
    dtb.extend_from_slice(header.as_bytes());
    dtb.extend_from_slice(&rsvmap);
    dtb.extend_from_slice(&blocks.structure);
    dtb.extend_from_slice(&blocks.strings);
    dtb
}

fn be32(value: usize) -> big_endian::U32 {
    u32::try_from(value).expect("FDT block size exceeds u32").into()
}
