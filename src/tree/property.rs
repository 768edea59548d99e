// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use alloc::{string::String, vec::Vec};

/// A named property of a live tree node.
///
/// The value is an opaque byte buffer; string values carry their trailing
/// NUL byte exactly as they appear in a flattened device tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    name: String,
    value: Vec<u8>,
}

impl Property {
    /// Creates a new `Property` with the given name and value.
    ///
    /// # Examples
    ///
    /// ```
    /// # use dt_overlay::tree::Property;
    /// let prop = Property::new("my-prop", vec![1, 2, 3, 4]);
    /// assert_eq!(prop.name(), "my-prop");
    /// assert_eq!(prop.value(), &[1, 2, 3, 4]);
    /// ```
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Creates a new string-valued `Property`, appending the NUL terminator.
    ///
    /// # Examples
    ///
    /// ```
    /// # use dt_overlay::tree::Property;
    /// let prop = Property::from_str("target-path", "/bus");
    /// assert_eq!(prop.value(), b"/bus\0");
    /// assert_eq!(prop.as_str(), Ok("/bus"));
    /// ```
    #[must_use]
    pub fn from_str(name: impl Into<String>, value: &str) -> Self {
        let mut bytes = Vec::with_capacity(value.len() + 1);
        bytes.extend_from_slice(value.as_bytes());
        bytes.push(0);
        Self {
            name: name.into(),
            value: bytes,
        }
    }

    /// Returns the name of this property.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the value of this property.
    #[must_use]
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// Sets the value of this property.
    pub fn set_value(&mut self, value: impl Into<Vec<u8>>) {
        self.value = value.into();
    }

    pub(crate) fn value_mut(&mut self) -> &mut Vec<u8> {
        &mut self.value
    }

    /// Returns the value of this property as a `u32`.
    ///
    /// # Examples
    ///
    /// ```
    /// # use dt_overlay::tree::Property;
    /// let prop = Property::new("my-prop", 1234u32.to_be_bytes());
    /// assert_eq!(prop.as_u32(), Ok(1234));
    /// ```
    pub fn as_u32(&self) -> Result<u32, ()> {
        self.value
            .as_slice()
            .try_into()
            .map(u32::from_be_bytes)
            .map_err(|_| ())
    }

    /// Returns the value of this property as a string.
    ///
    /// The value must contain a NUL terminator; the returned string stops at
    /// the first one.
    ///
    /// # Examples
    ///
    /// ```
    /// # use dt_overlay::tree::Property;
    /// let prop = Property::new("my-prop", b"hello\0".as_slice());
    /// assert_eq!(prop.as_str(), Ok("hello"));
    /// ```
    pub fn as_str(&self) -> Result<&str, ()> {
        let end = self.value.iter().position(|&b| b == 0).ok_or(())?;
        core::str::from_utf8(&self.value[..end]).map_err(|_| ())
    }
}
