use crate::error::CodecError;

pub(crate) const TAG_CONTROL_ANONYMOUS: u8 = 0x00;
pub(crate) const TAG_CONTROL_CONTEXT: u8 = 0x20;
pub(crate) const TAG_CONTROL_MASK: u8 = 0xE0;
pub(crate) const ELEMENT_TYPE_MASK: u8 = 0x1F;

/// Element tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    /// No tag (array members, top-level message).
    Anonymous,
    /// One-byte context-specific tag (structure/list members).
    Context(u8),
}

impl Tag {
    /// Bytes the tag occupies after the control byte.
    pub const fn encoded_len(self) -> usize {
        match self {
            Tag::Anonymous => 0,
            Tag::Context(_) => 1,
        }
    }

    pub(crate) const fn control_bits(self) -> u8 {
        match self {
            Tag::Anonymous => TAG_CONTROL_ANONYMOUS,
            Tag::Context(_) => TAG_CONTROL_CONTEXT,
        }
    }
}

/// Element type, the low five bits of the control byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ElementType {
    /// Signed 1-byte integer.
    Int8 = 0x00,
    /// Signed 2-byte integer.
    Int16 = 0x01,
    /// Signed 4-byte integer.
    Int32 = 0x02,
    /// Signed 8-byte integer.
    Int64 = 0x03,
    /// Unsigned 1-byte integer.
    UInt8 = 0x04,
    /// Unsigned 2-byte integer.
    UInt16 = 0x05,
    /// Unsigned 4-byte integer.
    UInt32 = 0x06,
    /// Unsigned 8-byte integer.
    UInt64 = 0x07,
    /// Boolean false.
    False = 0x08,
    /// Boolean true.
    True = 0x09,
    /// UTF-8 string with a 1-byte length.
    Utf8String1 = 0x0C,
    /// UTF-8 string with a 2-byte length.
    Utf8String2 = 0x0D,
    /// Octet string with a 1-byte length.
    ByteString1 = 0x10,
    /// Octet string with a 2-byte length.
    ByteString2 = 0x11,
    /// Null.
    Null = 0x14,
    /// Start of a structure.
    Structure = 0x15,
    /// Start of an array.
    Array = 0x16,
    /// Start of a list.
    List = 0x17,
    /// Closes the innermost container.
    EndOfContainer = 0x18,
}

impl TryFrom<u8> for ElementType {
    type Error = CodecError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        use ElementType::*;
        Ok(match v {
            0x00 => Int8,
            0x01 => Int16,
            0x02 => Int32,
            0x03 => Int64,
            0x04 => UInt8,
            0x05 => UInt16,
            0x06 => UInt32,
            0x07 => UInt64,
            0x08 => False,
            0x09 => True,
            0x0C => Utf8String1,
            0x0D => Utf8String2,
            0x10 => ByteString1,
            0x11 => ByteString2,
            0x14 => Null,
            0x15 => Structure,
            0x16 => Array,
            0x17 => List,
            0x18 => EndOfContainer,
            other => return Err(CodecError::InvalidElementType(other)),
        })
    }
}

impl ElementType {
    /// Width of the fixed-size value following the tag (integers), or of the
    /// length prefix (strings). Zero for value-less types.
    pub(crate) fn value_width(self) -> usize {
        use ElementType::*;
        match self {
            Int8 | UInt8 | Utf8String1 | ByteString1 => 1,
            Int16 | UInt16 | Utf8String2 | ByteString2 => 2,
            Int32 | UInt32 => 4,
            Int64 | UInt64 => 8,
            _ => 0,
        }
    }
}

/// Kind of container element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerType {
    /// Members carry distinct context tags.
    Structure,
    /// Ordered anonymous members.
    Array,
    /// Ordered, possibly tagged members.
    List,
}

impl ContainerType {
    pub(crate) fn element_type(self) -> ElementType {
        match self {
            ContainerType::Structure => ElementType::Structure,
            ContainerType::Array => ElementType::Array,
            ContainerType::List => ElementType::List,
        }
    }
}

/// Control byte plus tag bytes.
pub const fn header_len(tag: Tag) -> usize {
    1 + tag.encoded_len()
}

/// An end-of-container marker is a single anonymous control byte.
pub const END_OF_CONTAINER_LEN: usize = 1;

/// Encoded size of a fixed-width unsigned integer element.
pub const fn uint_len(tag: Tag, width: usize) -> usize {
    header_len(tag) + width
}

/// Encoded size of a boolean element (value lives in the control byte).
pub const fn bool_len(tag: Tag) -> usize {
    header_len(tag)
}

/// Encoded size of a container holding `inner` bytes of members.
pub const fn container_len(tag: Tag, inner: usize) -> usize {
    header_len(tag) + inner + END_OF_CONTAINER_LEN
}
