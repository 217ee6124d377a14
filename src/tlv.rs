//! Tag-length-value codec.
//!
//! A compact binary encoding: each element is a control byte (element type in
//! the low five bits, tag control in the high three), an optional one-byte
//! context tag, then the value. Containers (structure, array, list) are closed
//! by an end-of-container marker.
//!
//! ```text
//! +---------+---------+------------------+
//! | control | [tag]   | value / length   |
//! +---------+---------+------------------+
//! ```
//!
//! Unsigned integers are written at the fixed width of their schema type so the
//! framing cost of every message element is a compile-time constant.

mod element;
mod reader;
mod writer;

pub use element::{
    bool_len, container_len, header_len, uint_len, ContainerType, ElementType, Tag,
    END_OF_CONTAINER_LEN,
};
pub use reader::{Element, TlvReader, Value};
pub use writer::{Checkpoint, TlvWriter};

use crate::error::CodecError;
use bytes::Bytes;

/// Pre-encoded command fields: the members of a command's fields structure.
///
/// The core never interprets these bytes; they travel from the sender's
/// application to the handler's dispatch target unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandFields(Bytes);

impl CommandFields {
    /// Fields with no members.
    pub fn empty() -> Self {
        Self(Bytes::new())
    }

    /// Encode fields with a closure writing the structure members.
    ///
    /// ```
    /// use invoke_interaction::tlv::{CommandFields, Tag};
    ///
    /// let fields = CommandFields::encode(|w| {
    ///     w.put_u8(Tag::Context(0), 5)?;
    ///     w.put_str(Tag::Context(1), "kitchen")
    /// })
    /// .unwrap();
    /// assert!(!fields.is_empty());
    /// ```
    pub fn encode<F>(f: F) -> Result<Self, CodecError>
    where
        F: FnOnce(&mut TlvWriter) -> Result<(), CodecError>,
    {
        let mut w = TlvWriter::unbounded();
        f(&mut w)?;
        Ok(Self(w.finish()?))
    }

    /// Wrap raw member bytes after checking they form complete, balanced elements.
    pub fn from_raw(raw: impl Into<Bytes>) -> Result<Self, CodecError> {
        let raw = raw.into();
        TlvReader::validate_sequence(&raw)?;
        Ok(Self(raw))
    }

    pub(crate) fn from_validated(raw: Bytes) -> Self {
        Self(raw)
    }

    /// Encoded member bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Encoded length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when there are no members.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Reader over the members.
    pub fn reader(&self) -> TlvReader<'_> {
        TlvReader::new(&self.0)
    }

    /// Write the fields as a structure tagged `tag`.
    pub fn write_as_struct(&self, w: &mut TlvWriter, tag: Tag) -> Result<(), CodecError> {
        w.ensure_fits(container_len(tag, self.0.len()))?;
        w.start_container(tag, ContainerType::Structure)?;
        w.put_raw(&self.0)?;
        w.end_container()
    }
}
