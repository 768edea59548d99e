// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Error types for flattened device tree parsing.

use core::fmt;

/// A flattened device tree blob could not be decoded.
///
/// Carries the byte offset at which decoding failed, for diagnostics.
#[derive(Debug)]
#[non_exhaustive]
pub struct FdtError {
    offset: usize,
    /// What went wrong.
    pub kind: FdtErrorKind,
}

impl FdtError {
    pub(crate) fn new(kind: FdtErrorKind, offset: usize) -> Self {
        Self { offset, kind }
    }
}

/// The ways a flattened device tree blob can fail to decode.
#[derive(Debug)]
#[non_exhaustive]
pub enum FdtErrorKind {
    /// The blob does not start with the FDT magic number.
    InvalidMagic,
    /// The blob's version window does not include the version this
    /// library speaks.
    UnsupportedVersion(u32),
    /// A size or offset points outside the blob.
    InvalidLength,
    /// An unknown structure block token.
    BadToken(u32),
    /// A string is unterminated or not UTF-8.
    InvalidString,
}

impl fmt::Display for FdtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match &self.kind {
            FdtErrorKind::InvalidMagic => "invalid FDT magic number",
            FdtErrorKind::UnsupportedVersion(version) => {
                return write!(
                    f,
                    "the FDT version {} is not supported (at offset {})",
                    version, self.offset
                );
            }
            FdtErrorKind::InvalidLength => "invalid FDT length",
            FdtErrorKind::BadToken(token) => {
                return write!(f, "bad FDT token 0x{:x} at offset {}", token, self.offset);
            }
            FdtErrorKind::InvalidString => "invalid string in FDT",
        };
        write!(f, "{} at offset {}", what, self.offset)
    }
}

impl core::error::Error for FdtError {}
