// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A read-only, zero-copy decoder for [Flattened Device Tree (FDT)] blobs.
//!
//! [`Fdt::new`] validates a blob header and hands out [`FdtNode`] /
//! [`FdtProperty`] views that borrow the blob; nothing is allocated.  The
//! overlay engine runs every overlay input through this decoder before
//! unflattening it into the live tree's arena.
//!
//! Internally the structure block is walked with a handful of offset
//! helpers on [`Fdt`]; per-node iteration lives in a single scanner that
//! yields a node's properties and children in blob order.
//!
//! [Flattened Device Tree (FDT)]: https://devicetree-specification.readthedocs.io/en/latest/chapter5-flattened-format.html

pub(crate) mod layout;
mod node;
mod property;

use core::fmt;

use zerocopy::FromBytes;

use crate::error::{FdtError, FdtErrorKind};
use layout::Header;

pub use node::FdtNode;
pub use property::FdtProperty;

/// A validated view of a flattened device tree blob.
pub struct Fdt<'a> {
    data: &'a [u8],
}

impl<'a> Fdt<'a> {
    /// Validates the header of `data` and returns a decoder for it.
    ///
    /// The slice may be larger than the blob it carries (overlay blobs
    /// often arrive in oversized buffers); the view is cut down to the
    /// header's `totalsize`.
    ///
    /// # Examples
    ///
    /// ```
    /// # use dt_overlay::{fdt::Fdt, tree::LiveTree, writer};
    /// let mut tree = LiveTree::new();
    /// tree.add_child(tree.root(), "bus").unwrap();
    /// let dtb = writer::to_dtb(&tree, tree.root());
    /// let fdt = Fdt::new(&dtb).unwrap();
    /// ```
    pub fn new(data: &'a [u8]) -> Result<Self, FdtError> {
        let Ok((header, _)) = Header::ref_from_prefix(data) else {
            return Err(FdtError::new(FdtErrorKind::InvalidLength, 0));
        };

        if header.magic.get() != layout::MAGIC {
            return Err(FdtError::new(FdtErrorKind::InvalidMagic, 0));
        }

        let accepted = header.last_comp_version.get()..=header.version.get();
        if !accepted.contains(&layout::VERSION) {
            return Err(FdtError::new(
                FdtErrorKind::UnsupportedVersion(header.version.get()),
                20,
            ));
        }

        let total = header.totalsize.get() as usize;
        if total < size_of::<Header>() || total > data.len() {
            return Err(FdtError::new(FdtErrorKind::InvalidLength, 4));
        }

        Ok(Self {
            data: &data[..total],
        })
    }

    fn header(&self) -> &Header {
        let (header, _) = Header::ref_from_prefix(self.data).expect("validated by new()");
        header
    }

    /// Returns the size in bytes of the blob, per its header.
    #[must_use]
    pub fn total_size(&self) -> usize {
        self.header().totalsize.get() as usize
    }

    /// Returns the root node of the device tree.
    pub fn root(&self) -> Result<FdtNode<'_>, FdtError> {
        let start = self.header().off_dt_struct.get() as usize;
        match self.cell_at(start)? {
            layout::TOKEN_BEGIN_NODE => Ok(FdtNode { fdt: self, start }),
            token => Err(FdtError::new(FdtErrorKind::BadToken(token), start)),
        }
    }

    /// Looks up a node by absolute path, descending one named child per
    /// segment.
    ///
    /// # Performance
    ///
    /// Each segment scans the children of one node.  Unflatten into a
    /// [`LiveTree`](crate::tree::LiveTree) when lookups are frequent.
    pub fn find_node(&self, path: &str) -> Option<Result<FdtNode<'_>, FdtError>> {
        let rest = path.strip_prefix('/')?;
        let mut node = match self.root() {
            Ok(node) => node,
            Err(e) => return Some(Err(e)),
        };
        for segment in rest.split('/').filter(|s| !s.is_empty()) {
            match node.child(segment) {
                Ok(Some(found)) => node = found,
                Ok(None) => return None,
                Err(e) => return Some(Err(e)),
            }
        }
        Some(Ok(node))
    }

    /// Returns `len` bytes of the blob starting at `pos`.
    pub(crate) fn bytes_at(&self, pos: usize, len: usize) -> crate::Result<&'a [u8]> {
        let data: &'a [u8] = self.data;
        let end = pos
            .checked_add(len)
            .ok_or(FdtError::new(FdtErrorKind::InvalidLength, pos))?;
        data.get(pos..end)
            .ok_or(FdtError::new(FdtErrorKind::InvalidLength, pos))
    }

    /// Reads the big-endian cell at `pos`: a token, a length, or an offset.
    pub(crate) fn cell_at(&self, pos: usize) -> crate::Result<u32> {
        let bytes = self.bytes_at(pos, layout::TOKEN_SIZE)?;
        Ok(u32::from_be_bytes(bytes.try_into().expect("four bytes")))
    }

    /// Reads the NUL-terminated string starting at `pos`.
    pub(crate) fn string_at(&self, pos: usize) -> crate::Result<&'a str> {
        let data: &'a [u8] = self.data;
        let invalid = FdtError::new(FdtErrorKind::InvalidString, pos);
        let Some(tail) = data.get(pos..) else {
            return Err(invalid);
        };
        let Some(len) = tail.iter().position(|&b| b == 0) else {
            return Err(invalid);
        };
        core::str::from_utf8(&tail[..len])
            .map_err(|_| FdtError::new(FdtErrorKind::InvalidString, pos))
    }

    /// Reads a property name from the strings block.  The name must be
    /// NUL-terminated within the block.
    pub(crate) fn strings_entry(&self, offset: usize) -> crate::Result<&'a str> {
        let data: &'a [u8] = self.data;
        let header = self.header();
        let start = header.off_dt_strings.get() as usize;
        let size = header.size_dt_strings.get() as usize;

        let block = start
            .checked_add(size)
            .and_then(|end| data.get(start..end))
            .ok_or(FdtError::new(FdtErrorKind::InvalidLength, start))?;
        let entry = block
            .get(offset..)
            .ok_or(FdtError::new(FdtErrorKind::InvalidLength, start + offset))?;
        let len = entry
            .iter()
            .position(|&b| b == 0)
            .ok_or(FdtError::new(FdtErrorKind::InvalidString, start + offset))?;
        core::str::from_utf8(&entry[..len])
            .map_err(|_| FdtError::new(FdtErrorKind::InvalidString, start + offset))
    }

    /// Advances past a node's `BEGIN_NODE` token and name, to its first
    /// property or child token.
    pub(crate) fn skip_node_header(&self, start: usize) -> crate::Result<usize> {
        let name_start = start + layout::TOKEN_SIZE;
        let tail = self
            .data
            .get(name_start..)
            .ok_or(FdtError::new(FdtErrorKind::InvalidString, name_start))?;
        let name_len = tail
            .iter()
            .position(|&b| b == 0)
            .ok_or(FdtError::new(FdtErrorKind::InvalidString, name_start))?;
        Ok(layout::align_up(name_start + name_len + 1))
    }

    /// Advances past the property record whose `PROP` token is at `pos`.
    pub(crate) fn skip_property(&self, pos: usize) -> crate::Result<usize> {
        let value_len = self.cell_at(pos + layout::TOKEN_SIZE)? as usize;
        Ok(layout::align_up(pos + 3 * layout::TOKEN_SIZE + value_len))
    }

    /// Advances past the whole subtree whose `BEGIN_NODE` token is at
    /// `start`, tracking nesting depth instead of recursing.
    pub(crate) fn skip_subtree(&self, start: usize) -> crate::Result<usize> {
        let mut pos = self.skip_node_header(start)?;
        let mut depth = 1usize;
        while depth > 0 {
            let at = pos;
            match self.cell_at(at)? {
                layout::TOKEN_BEGIN_NODE => {
                    pos = self.skip_node_header(at)?;
                    depth += 1;
                }
                layout::TOKEN_END_NODE => {
                    pos = at + layout::TOKEN_SIZE;
                    depth -= 1;
                }
                layout::TOKEN_PROP => pos = self.skip_property(at)?,
                layout::TOKEN_NOP => pos = at + layout::TOKEN_SIZE,
                token => return Err(FdtError::new(FdtErrorKind::BadToken(token), at)),
            }
        }
        Ok(pos)
    }
}

impl<'a> fmt::Display for Fdt<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "/dts-v1/;")?;
        writeln!(f)?;
        let root = self.root().map_err(|_| fmt::Error)?;
        root.render(f, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::LiveTree;
    use crate::writer;
    use alloc::vec::Vec;

    /// A root-only blob straight from the writer; header fields are then
    /// corrupted in place.
    fn minimal_blob() -> Vec<u8> {
        let tree = LiveTree::new();
        writer::to_dtb(&tree, tree.root())
    }

    #[test]
    fn accepts_writer_output() {
        let blob = minimal_blob();
        let fdt = Fdt::new(&blob).unwrap();
        assert_eq!(fdt.total_size(), blob.len());
        assert_eq!(fdt.root().unwrap().name().unwrap(), "");
    }

    #[test]
    fn rejects_wrong_magic() {
        let mut blob = minimal_blob();
        blob[0] ^= 0xff;
        let result = Fdt::new(&blob);
        assert!(matches!(result, Err(e) if matches!(e.kind, FdtErrorKind::InvalidMagic)));
    }

    #[test]
    fn rejects_blob_shorter_than_header() {
        let blob = minimal_blob();
        let result = Fdt::new(&blob[..size_of::<Header>() - 1]);
        assert!(matches!(result, Err(e) if matches!(e.kind, FdtErrorKind::InvalidLength)));
    }

    #[test]
    fn rejects_version_window_excluding_ours() {
        let mut blob = minimal_blob();
        // version lives at bytes 20..24; drop it to 16 so the window
        // becomes [16, 16].
        blob[20..24].copy_from_slice(&16u32.to_be_bytes());
        let result = Fdt::new(&blob);
        assert!(matches!(result, Err(e) if matches!(e.kind, FdtErrorKind::UnsupportedVersion(16))));
    }

    #[test]
    fn rejects_totalsize_beyond_carrier() {
        let blob = minimal_blob();
        let result = Fdt::new(&blob[..blob.len() - 4]);
        assert!(matches!(result, Err(e) if matches!(e.kind, FdtErrorKind::InvalidLength)));
    }

    #[test]
    fn truncates_oversized_carrier() {
        let mut blob = minimal_blob();
        let real_size = blob.len();
        blob.extend_from_slice(&[0xa5; 24]);
        let fdt = Fdt::new(&blob).unwrap();
        assert_eq!(fdt.total_size(), real_size);
        assert_eq!(fdt.data.len(), real_size);
    }
}
