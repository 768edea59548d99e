// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Node views over the structure block.
//!
//! A node's contents are scanned by [`NodeItems`], which yields the node's
//! properties and children interleaved in blob order.  The public
//! [`FdtNode::properties`] and [`FdtNode::children`] iterators are thin
//! filters over that scanner.

use core::fmt;

use super::layout;
use super::property::{self, FdtProperty};
use super::Fdt;
use crate::error::{FdtError, FdtErrorKind};

/// A node in a flattened device tree.
#[derive(Clone, Copy)]
pub struct FdtNode<'a> {
    pub(super) fdt: &'a Fdt<'a>,
    /// Offset of the node's `BEGIN_NODE` token.
    pub(super) start: usize,
}

impl<'a> FdtNode<'a> {
    /// Returns the name of this node; empty for the root.
    pub fn name(&self) -> Result<&'a str, FdtError> {
        self.fdt.string_at(self.start + layout::TOKEN_SIZE)
    }

    /// Returns an iterator over the properties of this node.
    pub fn properties(&self) -> impl Iterator<Item = crate::Result<FdtProperty<'a>>> + use<'a> {
        let mut items = NodeItems::of(self.fdt, self.start);
        // Properties precede children in the structure block; stop at the
        // first child.
        core::iter::from_fn(move || match items.next() {
            Some(Ok(Item::Property(prop))) => Some(Ok(prop)),
            Some(Ok(Item::Child(_))) | None => None,
            Some(Err(e)) => Some(Err(e)),
        })
    }

    /// Returns an iterator over the children of this node.
    pub fn children(&self) -> impl Iterator<Item = crate::Result<FdtNode<'a>>> + use<'a> {
        let mut items = NodeItems::of(self.fdt, self.start);
        core::iter::from_fn(move || loop {
            match items.next() {
                Some(Ok(Item::Child(child))) => return Some(Ok(child)),
                Some(Ok(Item::Property(_))) => continue,
                Some(Err(e)) => return Some(Err(e)),
                None => return None,
            }
        })
    }

    /// Finds a property of this node by name.
    ///
    /// # Performance
    ///
    /// Scans the node's properties in order.  Unflatten into a
    /// [`LiveTree`](crate::tree::LiveTree) when lookups are frequent.
    pub fn property(&self, name: &str) -> crate::Result<Option<FdtProperty<'a>>> {
        for prop in self.properties() {
            let prop = prop?;
            if prop.name() == name {
                return Ok(Some(prop));
            }
        }
        Ok(None)
    }

    /// Finds a child of this node by name.
    ///
    /// # Performance
    ///
    /// Scans the node's children in order; each skipped sibling costs a
    /// walk over its whole subtree.
    pub fn child(&self, name: &str) -> crate::Result<Option<FdtNode<'a>>> {
        for child in self.children() {
            let child = child?;
            if child.name()? == name {
                return Ok(Some(child));
            }
        }
        Ok(None)
    }

    /// Renders this node and its subtree in device tree source style.
    pub(crate) fn render(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        let indent = depth * 4;
        match self.name() {
            Ok("") => writeln!(f, "{:indent$}/ {{", "")?,
            Ok(name) => writeln!(f, "{:indent$}{} {{", "", name)?,
            Err(_) => return Err(fmt::Error),
        }

        for prop in self.properties() {
            match prop {
                Ok(prop) => prop.render(f, depth + 1)?,
                Err(_) => writeln!(f, "{:indent$}/* unreadable property */", "", indent = indent + 4)?,
            }
        }

        for child in self.children() {
            writeln!(f)?;
            match child {
                Ok(child) => child.render(f, depth + 1)?,
                Err(_) => writeln!(f, "{:indent$}/* unreadable node */", "", indent = indent + 4)?,
            }
        }

        writeln!(f, "{:indent$}}};", "")
    }
}

/// One element of a node's contents, in blob order.
enum Item<'a> {
    Property(FdtProperty<'a>),
    Child(FdtNode<'a>),
}

/// Scans the contents of a single node: its property records, then its
/// child subtrees (each skipped over as a unit, so yielding a child is
/// O(subtree), not O(1)).
///
/// The scanner fuses on the node's `END_NODE` token and on the first
/// error.
struct NodeItems<'a> {
    fdt: &'a Fdt<'a>,
    pos: usize,
    pending: Option<FdtError>,
    done: bool,
}

impl<'a> NodeItems<'a> {
    /// Positions a scanner just past the header of the node whose
    /// `BEGIN_NODE` token is at `node_start`.
    fn of(fdt: &'a Fdt<'a>, node_start: usize) -> Self {
        match fdt.skip_node_header(node_start) {
            Ok(pos) => Self {
                fdt,
                pos,
                pending: None,
                done: false,
            },
            Err(e) => Self {
                fdt,
                pos: 0,
                pending: Some(e),
                done: false,
            },
        }
    }

    fn fail(&mut self, error: FdtError) -> Option<crate::Result<Item<'a>>> {
        self.done = true;
        Some(Err(error))
    }
}

impl<'a> Iterator for NodeItems<'a> {
    type Item = crate::Result<Item<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Some(e) = self.pending.take() {
            return self.fail(e);
        }

        loop {
            let at = self.pos;
            let token = match self.fdt.cell_at(at) {
                Ok(token) => token,
                Err(e) => return self.fail(e),
            };
            match token {
                layout::TOKEN_NOP => self.pos = at + layout::TOKEN_SIZE,
                layout::TOKEN_PROP => match property::parse(self.fdt, at) {
                    Ok((prop, next_pos)) => {
                        self.pos = next_pos;
                        return Some(Ok(Item::Property(prop)));
                    }
                    Err(e) => return self.fail(e),
                },
                layout::TOKEN_BEGIN_NODE => {
                    let child = FdtNode {
                        fdt: self.fdt,
                        start: at,
                    };
                    match self.fdt.skip_subtree(at) {
                        Ok(next_pos) => {
                            self.pos = next_pos;
                            return Some(Ok(Item::Child(child)));
                        }
                        Err(e) => return self.fail(e),
                    }
                }
                layout::TOKEN_END_NODE | layout::TOKEN_END => {
                    self.done = true;
                    return None;
                }
                token => return self.fail(FdtError::new(FdtErrorKind::BadToken(token), at)),
            }
        }
    }
}
