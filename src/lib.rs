// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A devicetree overlay engine.
//!
//! The crate maintains a live devicetree and grafts overlay trees into it,
//! atomically and reversibly.  An overlay arrives as a flattened device tree
//! (FDT) blob, is unflattened and resolved against the live tree, decomposed
//! into a changeset of primitive edits, and applied as a unit.  Applied
//! overlays are recorded so that they can later be removed, restoring the
//! live tree to its prior state.
//!
//! The entry point is [`overlay::OverlayManager`].

#![no_std]
#![cfg_attr(docsrs, feature(doc_cfg))]

extern crate alloc;

pub type Result<T> = core::result::Result<T, FdtError>;

pub mod changeset;
pub mod error;
pub mod fdt;
pub mod overlay;
pub mod resolver;
pub mod tree;
pub mod writer;

pub use error::FdtError;
pub use fdt::Fdt;
pub use overlay::{OverlayError, OverlayId, OverlayManager};
pub use tree::{LiveTree, NodeId, Property};
