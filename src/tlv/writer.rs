use super::element::{ContainerType, ElementType, Tag};
use crate::error::CodecError;
use bytes::Bytes;

/// Saved writer position for [`TlvWriter::rollback`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    len: usize,
    reserved: usize,
    containers: Vec<ContainerType>,
}

/// Capacity-bounded TLV encoder.
///
/// Every single `put_*` is atomic: on `BufferTooSmall` nothing is written.
/// Multi-element transactions use [`checkpoint`](Self::checkpoint) and
/// [`rollback`](Self::rollback).
#[derive(Debug, Clone)]
pub struct TlvWriter {
    buf: Vec<u8>,
    capacity: usize,
    reserved: usize,
    containers: Vec<ContainerType>,
}

impl TlvWriter {
    /// Writer that refuses to grow past `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity.min(4096)),
            capacity,
            reserved: 0,
            containers: Vec::new(),
        }
    }

    /// Writer without a practical size bound (for building command fields).
    pub fn unbounded() -> Self {
        Self::new(usize::MAX)
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True when nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes that can still be written, after reservations.
    pub fn remaining_free_length(&self) -> usize {
        self.capacity.saturating_sub(self.buf.len()).saturating_sub(self.reserved)
    }

    /// Open container depth.
    pub fn depth(&self) -> usize {
        self.containers.len()
    }

    /// Hold back `n` bytes of capacity (for trailers that must always fit).
    pub fn reserve(&mut self, n: usize) -> Result<(), CodecError> {
        self.ensure(n)?;
        self.reserved += n;
        Ok(())
    }

    /// Release bytes held back by [`reserve`](Self::reserve).
    pub fn unreserve(&mut self, n: usize) {
        self.reserved = self.reserved.saturating_sub(n);
    }

    /// Mark the current position.
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            len: self.buf.len(),
            reserved: self.reserved,
            containers: self.containers.clone(),
        }
    }

    /// Restore the writer to `checkpoint`, discarding everything written since.
    pub fn rollback(&mut self, checkpoint: Checkpoint) {
        self.buf.truncate(checkpoint.len);
        self.reserved = checkpoint.reserved;
        self.containers = checkpoint.containers;
    }

    /// Fail with `BufferTooSmall` unless `n` more bytes fit.
    pub fn ensure_fits(&self, n: usize) -> Result<(), CodecError> {
        self.ensure(n)
    }

    fn ensure(&self, n: usize) -> Result<(), CodecError> {
        let available = self.remaining_free_length();
        if n > available {
            return Err(CodecError::BufferTooSmall { needed: n, available });
        }
        Ok(())
    }

    fn put_header(&mut self, tag: Tag, ty: ElementType) {
        self.buf.push(ty as u8 | tag.control_bits());
        if let Tag::Context(t) = tag {
            self.buf.push(t);
        }
    }

    fn put_fixed(&mut self, tag: Tag, ty: ElementType, value: &[u8]) -> Result<(), CodecError> {
        self.ensure(1 + tag.encoded_len() + value.len())?;
        self.put_header(tag, ty);
        self.buf.extend_from_slice(value);
        Ok(())
    }

    /// Unsigned 8-bit integer.
    pub fn put_u8(&mut self, tag: Tag, v: u8) -> Result<(), CodecError> {
        self.put_fixed(tag, ElementType::UInt8, &[v])
    }

    /// Unsigned 16-bit integer.
    pub fn put_u16(&mut self, tag: Tag, v: u16) -> Result<(), CodecError> {
        self.put_fixed(tag, ElementType::UInt16, &v.to_le_bytes())
    }

    /// Unsigned 32-bit integer.
    pub fn put_u32(&mut self, tag: Tag, v: u32) -> Result<(), CodecError> {
        self.put_fixed(tag, ElementType::UInt32, &v.to_le_bytes())
    }

    /// Unsigned 64-bit integer.
    pub fn put_u64(&mut self, tag: Tag, v: u64) -> Result<(), CodecError> {
        self.put_fixed(tag, ElementType::UInt64, &v.to_le_bytes())
    }

    /// Signed 32-bit integer.
    pub fn put_i32(&mut self, tag: Tag, v: i32) -> Result<(), CodecError> {
        self.put_fixed(tag, ElementType::Int32, &v.to_le_bytes())
    }

    /// Signed 64-bit integer.
    pub fn put_i64(&mut self, tag: Tag, v: i64) -> Result<(), CodecError> {
        self.put_fixed(tag, ElementType::Int64, &v.to_le_bytes())
    }

    /// Boolean.
    pub fn put_bool(&mut self, tag: Tag, v: bool) -> Result<(), CodecError> {
        let ty = if v { ElementType::True } else { ElementType::False };
        self.put_fixed(tag, ty, &[])
    }

    /// Null.
    pub fn put_null(&mut self, tag: Tag) -> Result<(), CodecError> {
        self.put_fixed(tag, ElementType::Null, &[])
    }

    /// UTF-8 string, length-prefixed with one or two bytes.
    pub fn put_str(&mut self, tag: Tag, v: &str) -> Result<(), CodecError> {
        self.put_string(tag, v.as_bytes(), ElementType::Utf8String1, ElementType::Utf8String2)
    }

    /// Octet string, length-prefixed with one or two bytes.
    pub fn put_bytes(&mut self, tag: Tag, v: &[u8]) -> Result<(), CodecError> {
        self.put_string(tag, v, ElementType::ByteString1, ElementType::ByteString2)
    }

    fn put_string(
        &mut self,
        tag: Tag,
        v: &[u8],
        short: ElementType,
        long: ElementType,
    ) -> Result<(), CodecError> {
        if let Ok(len) = u8::try_from(v.len()) {
            self.ensure(1 + tag.encoded_len() + 1 + v.len())?;
            self.put_header(tag, short);
            self.buf.push(len);
        } else {
            let len = u16::try_from(v.len())
                .map_err(|_| CodecError::ValueOutOfRange("string length"))?;
            self.ensure(1 + tag.encoded_len() + 2 + v.len())?;
            self.put_header(tag, long);
            self.buf.extend_from_slice(&len.to_le_bytes());
        }
        self.buf.extend_from_slice(v);
        Ok(())
    }

    /// Open a container.
    pub fn start_container(&mut self, tag: Tag, kind: ContainerType) -> Result<(), CodecError> {
        self.put_fixed(tag, kind.element_type(), &[])?;
        self.containers.push(kind);
        Ok(())
    }

    /// Close the innermost open container.
    pub fn end_container(&mut self) -> Result<(), CodecError> {
        if self.containers.is_empty() {
            return Err(CodecError::UnbalancedContainer);
        }
        self.ensure(1)?;
        self.buf.push(ElementType::EndOfContainer as u8);
        self.containers.pop();
        Ok(())
    }

    /// Append already-encoded elements verbatim.
    pub fn put_raw(&mut self, encoded: &[u8]) -> Result<(), CodecError> {
        self.ensure(encoded.len())?;
        self.buf.extend_from_slice(encoded);
        Ok(())
    }

    /// Bytes written so far.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Consume the writer. Fails if a container is still open.
    pub fn finish(self) -> Result<Bytes, CodecError> {
        if !self.containers.is_empty() {
            return Err(CodecError::UnbalancedContainer);
        }
        Ok(Bytes::from(self.buf))
    }
}
