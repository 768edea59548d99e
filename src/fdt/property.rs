// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Property views over the structure block.

use core::fmt;

use super::layout;
use super::Fdt;
use crate::error::{FdtError, FdtErrorKind};

/// A property of a device tree node: a name from the strings block and a
/// value slice from the structure block.
#[derive(Debug)]
pub struct FdtProperty<'a> {
    name: &'a str,
    value: &'a [u8],
    /// Offset of the value, used in decode error reports.
    offset: usize,
}

/// Decodes the property record whose `PROP` token is at `pos`.  Returns
/// the property and the offset of the next token.
pub(super) fn parse<'a>(
    fdt: &'a Fdt<'a>,
    pos: usize,
) -> Result<(FdtProperty<'a>, usize), FdtError> {
    let value_len = fdt.cell_at(pos + layout::TOKEN_SIZE)? as usize;
    let name_offset = fdt.cell_at(pos + 2 * layout::TOKEN_SIZE)? as usize;
    let value_start = pos + 3 * layout::TOKEN_SIZE;

    let property = FdtProperty {
        name: fdt.strings_entry(name_offset)?,
        value: fdt.bytes_at(value_start, value_len)?,
        offset: value_start,
    };
    Ok((property, layout::align_up(value_start + value_len)))
}

impl<'a> FdtProperty<'a> {
    /// Returns the name of this property.
    #[must_use]
    pub fn name(&self) -> &'a str {
        self.name
    }

    /// Returns the raw value of this property.
    #[must_use]
    pub fn value(&self) -> &'a [u8] {
        self.value
    }

    /// Interprets the value as a single big-endian `u32`.
    ///
    /// # Errors
    ///
    /// Returns [`FdtErrorKind::InvalidLength`] unless the value is exactly
    /// 4 bytes.
    pub fn as_u32(&self) -> Result<u32, FdtError> {
        self.value
            .try_into()
            .map(u32::from_be_bytes)
            .map_err(|_| FdtError::new(FdtErrorKind::InvalidLength, self.offset))
    }

    /// Interprets the value as a single big-endian `u64`.
    ///
    /// # Errors
    ///
    /// Returns [`FdtErrorKind::InvalidLength`] unless the value is exactly
    /// 8 bytes.
    pub fn as_u64(&self) -> Result<u64, FdtError> {
        self.value
            .try_into()
            .map(u64::from_be_bytes)
            .map_err(|_| FdtError::new(FdtErrorKind::InvalidLength, self.offset))
    }

    /// Interprets the value as one NUL-terminated string.
    ///
    /// # Errors
    ///
    /// Returns [`FdtErrorKind::InvalidString`] if the value does not end
    /// with the terminator, contains an interior NUL, or is not UTF-8.
    pub fn as_str(&self) -> Result<&'a str, FdtError> {
        let invalid = || FdtError::new(FdtErrorKind::InvalidString, self.offset);

        let (terminator, body) = self.value.split_last().ok_or_else(invalid)?;
        if *terminator != 0 || body.contains(&0) {
            return Err(invalid());
        }
        core::str::from_utf8(body).map_err(|_| invalid())
    }

    /// Interprets the value as a list of NUL-terminated strings, stopping
    /// at the first chunk that is not UTF-8.
    pub fn as_str_list(&self) -> impl Iterator<Item = &'a str> {
        self.value
            .split(|&b| b == 0)
            .map_while(|chunk| core::str::from_utf8(chunk).ok())
            .filter(|s| !s.is_empty())
    }

    /// Renders this property in device tree source style: as a string
    /// list, a cell list, or a byte list, whichever fits the value.
    pub(super) fn render(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        let indent = depth * 4;
        write!(f, "{:indent$}{}", "", self.name)?;

        if self.value.is_empty() {
            return writeln!(f, ";");
        }

        if self.looks_like_string_list() {
            write!(f, " = ")?;
            let mut separate = false;
            for s in self.as_str_list() {
                if separate {
                    write!(f, ", ")?;
                }
                separate = true;
                write!(f, "\"{s}\"")?;
            }
            return writeln!(f, ";");
        }

        if self.value.len().is_multiple_of(4) {
            write!(f, " = <")?;
            let mut separate = false;
            for chunk in self.value.chunks_exact(4) {
                let cell = u32::from_be_bytes(chunk.try_into().expect("chunks of four"));
                if separate {
                    write!(f, " ")?;
                }
                separate = true;
                write!(f, "0x{cell:x}")?;
            }
            return writeln!(f, ">;");
        }

        write!(f, " = [")?;
        let mut separate = false;
        for byte in self.value {
            if separate {
                write!(f, " ")?;
            }
            separate = true;
            write!(f, "{byte:02x}")?;
        }
        writeln!(f, "];")
    }

    /// A printable, NUL-terminated value with no empty strings renders as
    /// a quoted list.
    fn looks_like_string_list(&self) -> bool {
        self.value.len() > 1
            && self.value.ends_with(&[0])
            && self
                .value
                .iter()
                .all(|&b| b == 0 || b == b' ' || b.is_ascii_graphic())
            && !self.value.windows(2).any(|pair| pair == [0, 0])
    }
}
