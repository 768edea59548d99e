// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Error types for the overlay engine.

use alloc::string::String;
use core::fmt;

use super::OverlayId;
use crate::changeset::ChangesetError;
use crate::error::FdtError;

/// An error that can occur when applying or removing an overlay.
#[derive(Debug)]
#[non_exhaustive]
pub struct OverlayError {
    node: String,
    /// The type of the error that has occurred.
    pub kind: OverlayErrorKind,
    /// The overlay changeset that remains recorded despite the failure.
    ///
    /// Set when an overlay was applied but a later step failed; the caller
    /// is expected to pass the id to
    /// [`OverlayManager::remove`](super::OverlayManager::remove).
    pub changeset: Option<OverlayId>,
}

impl OverlayError {
    pub(crate) fn new(kind: OverlayErrorKind, node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            kind,
            changeset: None,
        }
    }

    pub(crate) fn with_changeset(mut self, id: OverlayId) -> Self {
        self.changeset = Some(id);
        self
    }

    /// Creates a subscriber veto, to be returned from a notifier callback.
    #[must_use]
    pub fn veto(reason: impl Into<String>) -> Self {
        Self::new(OverlayErrorKind::NotifierVeto, reason)
    }

    /// Returns the boundary class of this error.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self.kind {
            OverlayErrorKind::TreeCorrupt | OverlayErrorKind::NotTopmost => ErrorClass::Busy,
            OverlayErrorKind::UnknownId => ErrorClass::NoDev,
            _ => ErrorClass::Invalid,
        }
    }
}

/// The boundary classes an [`OverlayError`] maps onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed input or a semantic violation.
    Invalid,
    /// The engine refuses to operate: corruption latched or removal of a
    /// non-topmost overlay.
    Busy,
    /// No overlay changeset with the given id.
    NoDev,
}

/// The kind of an error that can occur when applying or removing an overlay.
#[derive(Debug)]
#[non_exhaustive]
pub enum OverlayErrorKind {
    /// The overlay blob could not be decoded.
    Fdt(FdtError),
    /// A fragment has no usable `target` or `target-path` property.
    NoTarget,
    /// A fragment's target was not found in the live tree.
    TargetNotFound,
    /// The overlay holds no fragments and no symbols.
    NoFragments,
    /// The overlay has symbols but the live tree has no `/__symbols__` node.
    SymbolsMissing,
    /// The overlay changes `#address-cells` or `#size-cells` of a live node.
    CellsMismatch,
    /// The overlay updates an existing property of the symbols node.
    SymbolsUpdate,
    /// A symbols property does not name a node within an overlay fragment.
    BadSymbolPath,
    /// Overlay and live tree declare a phandle for the same node.
    PhandleCollision,
    /// Multiple fragments edit the same node or property.
    DuplicateEdit,
    /// A fixup entry refers to a symbol the live tree does not define.
    UnresolvedSymbol,
    /// A `__fixups__` or `__local_fixups__` entry is malformed.
    BadFixup,
    /// The primitive changeset engine failed.
    Changeset(ChangesetError),
    /// The overlay is not the topmost one affecting its nodes.
    NotTopmost,
    /// A previous failed recovery left the tree state unknown.
    TreeCorrupt,
    /// No overlay changeset with the given id exists.
    UnknownId,
    /// A notifier rejected the operation.
    NotifierVeto,
}

impl fmt::Display for OverlayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.node.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{} at `{}`", self.kind, self.node)
        }
    }
}

impl fmt::Display for OverlayErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fdt(e) => write!(f, "invalid overlay blob: {e}"),
            Self::NoTarget => write!(f, "no target property"),
            Self::TargetNotFound => write!(f, "target not found"),
            Self::NoFragments => write!(f, "no fragments or symbols in overlay"),
            Self::SymbolsMissing => write!(f, "symbols in overlay, but not in live tree"),
            Self::CellsMismatch => {
                write!(f, "changing value of #address-cells/#size-cells is not allowed")
            }
            Self::SymbolsUpdate => write!(f, "update of property in symbols node is not allowed"),
            Self::BadSymbolPath => write!(f, "symbol path does not match an overlay fragment"),
            Self::PhandleCollision => write!(f, "conflicting phandle declarations"),
            Self::DuplicateEdit => write!(f, "multiple fragments edit the same node or property"),
            Self::UnresolvedSymbol => write!(f, "symbol not found in live tree"),
            Self::BadFixup => write!(f, "malformed phandle fixup"),
            Self::Changeset(e) => write!(f, "changeset failed: {e}"),
            Self::NotTopmost => write!(f, "overlay is not topmost"),
            Self::TreeCorrupt => write!(f, "devicetree state suspect"),
            Self::UnknownId => write!(f, "no such overlay changeset"),
            Self::NotifierVeto => write!(f, "rejected by notifier"),
        }
    }
}

impl core::error::Error for OverlayError {}

impl From<FdtError> for OverlayError {
    fn from(e: FdtError) -> Self {
        OverlayError::new(OverlayErrorKind::Fdt(e), "")
    }
}

impl From<ChangesetError> for OverlayError {
    fn from(e: ChangesetError) -> Self {
        OverlayError::new(OverlayErrorKind::Changeset(e), "")
    }
}
