use super::element::{
    ContainerType, ElementType, Tag, ELEMENT_TYPE_MASK, TAG_CONTROL_ANONYMOUS, TAG_CONTROL_CONTEXT,
    TAG_CONTROL_MASK,
};
use crate::error::CodecError;

/// Decoded element value. Strings and containers borrow from the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Value<'a> {
    /// Any signed integer width.
    Signed(i64),
    /// Any unsigned integer width.
    Unsigned(u64),
    /// Boolean.
    Bool(bool),
    /// UTF-8 string.
    Utf8(&'a str),
    /// Octet string.
    Bytes(&'a [u8]),
    /// Null.
    Null,
    /// Start of a container; members follow until the matching end.
    Container(ContainerType),
    /// End of the innermost container.
    EndOfContainer,
}

/// One element: tag plus value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Element<'a> {
    /// Element tag.
    pub tag: Tag,
    /// Element value.
    pub value: Value<'a>,
}

impl<'a> Element<'a> {
    /// Unsigned value narrowed to `u8`.
    pub fn u8(&self, field: &'static str) -> Result<u8, CodecError> {
        u8::try_from(self.unsigned(field)?).map_err(|_| CodecError::ValueOutOfRange(field))
    }

    /// Unsigned value narrowed to `u16`.
    pub fn u16(&self, field: &'static str) -> Result<u16, CodecError> {
        u16::try_from(self.unsigned(field)?).map_err(|_| CodecError::ValueOutOfRange(field))
    }

    /// Unsigned value narrowed to `u32`.
    pub fn u32(&self, field: &'static str) -> Result<u32, CodecError> {
        u32::try_from(self.unsigned(field)?).map_err(|_| CodecError::ValueOutOfRange(field))
    }

    /// Unsigned value. Non-negative signed encodings are accepted.
    pub fn unsigned(&self, field: &'static str) -> Result<u64, CodecError> {
        match self.value {
            Value::Unsigned(v) => Ok(v),
            Value::Signed(v) => u64::try_from(v).map_err(|_| CodecError::ValueOutOfRange(field)),
            _ => Err(CodecError::UnexpectedElement { expected: "unsigned integer" }),
        }
    }

    /// Boolean value.
    pub fn bool(&self) -> Result<bool, CodecError> {
        match self.value {
            Value::Bool(v) => Ok(v),
            _ => Err(CodecError::UnexpectedElement { expected: "boolean" }),
        }
    }

    /// Fail unless this element opens a container of `kind`.
    pub fn expect_container(&self, kind: ContainerType) -> Result<(), CodecError> {
        match self.value {
            Value::Container(k) if k == kind => Ok(()),
            _ => Err(CodecError::UnexpectedElement {
                expected: match kind {
                    ContainerType::Structure => "structure",
                    ContainerType::Array => "array",
                    ContainerType::List => "list",
                },
            }),
        }
    }

    /// Context tag number, if the element has one.
    pub fn context_tag(&self) -> Option<u8> {
        match self.tag {
            Tag::Context(t) => Some(t),
            Tag::Anonymous => None,
        }
    }
}

/// Sequential TLV decoder over a byte slice.
#[derive(Debug, Clone)]
pub struct TlvReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> TlvReader<'a> {
    /// Reader positioned at the start of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Current byte offset.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes not consumed yet.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::UnexpectedEnd);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn take_le(&mut self, n: usize) -> Result<u64, CodecError> {
        let raw = self.take(n)?;
        Ok(raw.iter().rev().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
    }

    /// Read the next element, or `None` at the end of input.
    pub fn next_element(&mut self) -> Result<Option<Element<'a>>, CodecError> {
        if self.remaining() == 0 {
            return Ok(None);
        }
        let control = self.take(1)?[0];
        let tag = match control & TAG_CONTROL_MASK {
            TAG_CONTROL_ANONYMOUS => Tag::Anonymous,
            TAG_CONTROL_CONTEXT => Tag::Context(self.take(1)?[0]),
            other => return Err(CodecError::InvalidTagControl(other)),
        };
        let ty = ElementType::try_from(control & ELEMENT_TYPE_MASK)?;
        let width = ty.value_width();
        let value = match ty {
            ElementType::Int8 => Value::Signed(i64::from(self.take_le(1)? as u8 as i8)),
            ElementType::Int16 => Value::Signed(i64::from(self.take_le(2)? as u16 as i16)),
            ElementType::Int32 => Value::Signed(i64::from(self.take_le(4)? as u32 as i32)),
            ElementType::Int64 => Value::Signed(self.take_le(8)? as i64),
            ElementType::UInt8
            | ElementType::UInt16
            | ElementType::UInt32
            | ElementType::UInt64 => Value::Unsigned(self.take_le(width)?),
            ElementType::False => Value::Bool(false),
            ElementType::True => Value::Bool(true),
            ElementType::Utf8String1 | ElementType::Utf8String2 => {
                let len = self.take_le(width)? as usize;
                let raw = self.take(len)?;
                Value::Utf8(std::str::from_utf8(raw).map_err(|_| CodecError::InvalidUtf8)?)
            }
            ElementType::ByteString1 | ElementType::ByteString2 => {
                let len = self.take_le(width)? as usize;
                Value::Bytes(self.take(len)?)
            }
            ElementType::Null => Value::Null,
            ElementType::Structure => Value::Container(ContainerType::Structure),
            ElementType::Array => Value::Container(ContainerType::Array),
            ElementType::List => Value::Container(ContainerType::List),
            ElementType::EndOfContainer => {
                if tag != Tag::Anonymous {
                    return Err(CodecError::UnexpectedElement {
                        expected: "anonymous end-of-container",
                    });
                }
                Value::EndOfContainer
            }
        };
        Ok(Some(Element { tag, value }))
    }

    /// Read the next element, treating end of input as an error.
    pub fn expect_next(&mut self) -> Result<Element<'a>, CodecError> {
        self.next_element()?.ok_or(CodecError::UnexpectedEnd)
    }

    /// Skip the members of a container whose start element was just read.
    /// Returns the raw member bytes, excluding the closing marker.
    pub fn skip_container(&mut self) -> Result<&'a [u8], CodecError> {
        let start = self.pos;
        let mut depth = 1usize;
        loop {
            let before = self.pos;
            let el = self.expect_next()?;
            match el.value {
                Value::Container(_) => depth += 1,
                Value::EndOfContainer => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(&self.buf[start..before]);
                    }
                }
                _ => {}
            }
        }
    }

    /// Skip one element (a whole container if it opens one).
    pub fn skip_element(&mut self, el: &Element<'a>) -> Result<(), CodecError> {
        if let Value::Container(_) = el.value {
            self.skip_container()?;
        }
        Ok(())
    }

    /// Check that `buf` is a balanced sequence of complete elements.
    pub fn validate_sequence(buf: &'a [u8]) -> Result<(), CodecError> {
        let mut reader = TlvReader::new(buf);
        while let Some(el) = reader.next_element()? {
            match el.value {
                Value::Container(_) => {
                    reader.skip_container()?;
                }
                Value::EndOfContainer => return Err(CodecError::UnbalancedContainer),
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tlv::TlvWriter;

    #[test]
    fn reads_what_writer_wrote() {
        let mut w = TlvWriter::unbounded();
        w.start_container(Tag::Anonymous, ContainerType::Structure).unwrap();
        w.put_u32(Tag::Context(1), 0xDEAD_BEEF).unwrap();
        w.put_str(Tag::Context(2), "on").unwrap();
        w.put_i32(Tag::Context(3), -5).unwrap();
        w.end_container().unwrap();
        let bytes = w.finish().unwrap();

        let mut r = TlvReader::new(&bytes);
        let outer = r.expect_next().unwrap();
        outer.expect_container(ContainerType::Structure).unwrap();
        let a = r.expect_next().unwrap();
        assert_eq!(a.context_tag(), Some(1));
        assert_eq!(a.u32("a").unwrap(), 0xDEAD_BEEF);
        assert_eq!(r.expect_next().unwrap().value, Value::Utf8("on"));
        assert_eq!(r.expect_next().unwrap().value, Value::Signed(-5));
        assert_eq!(r.expect_next().unwrap().value, Value::EndOfContainer);
        assert!(r.next_element().unwrap().is_none());
    }

    #[test]
    fn narrowing_checks_range() {
        let el = Element { tag: Tag::Anonymous, value: Value::Unsigned(300) };
        assert_eq!(el.u8("status"), Err(CodecError::ValueOutOfRange("status")));
        assert_eq!(el.u16("ep").unwrap(), 300);
    }

    #[test]
    fn truncated_input_is_error() {
        let mut r = TlvReader::new(&[0x25, 0x01, 0x02]);
        assert_eq!(r.next_element(), Err(CodecError::UnexpectedEnd));
    }

    #[test]
    fn skip_container_returns_inner_span() {
        // struct { [0] u8 7, list { } }
        let raw = [0x15, 0x24, 0x00, 0x07, 0x17, 0x18, 0x18];
        let mut r = TlvReader::new(&raw);
        r.expect_next().unwrap();
        let inner = r.skip_container().unwrap();
        assert_eq!(inner, &raw[1..6]);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn validate_sequence_rejects_stray_end() {
        assert!(TlvReader::validate_sequence(&[0x24, 0x00, 0x01]).is_ok());
        assert_eq!(TlvReader::validate_sequence(&[0x18]), Err(CodecError::UnbalancedContainer));
        assert_eq!(TlvReader::validate_sequence(&[0x15]), Err(CodecError::UnexpectedEnd));
    }
}
