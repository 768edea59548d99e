// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use dt_overlay::tree::LiveTree;
use dt_overlay::writer;
use dt_overlay::OverlayManager;

/// Flattens a whole tree to a DTB blob.
pub fn to_blob(tree: &LiveTree) -> Vec<u8> {
    writer::to_dtb(tree, tree.root())
}

/// Flattens the manager's live tree for state comparisons.
pub fn snapshot(manager: &OverlayManager) -> Vec<u8> {
    manager.with_tree(|tree| writer::to_dtb(tree, tree.root()))
}
