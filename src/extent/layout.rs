//! On-device layout of one extent.
//!
//! An extent is a run of `[SlotHeader][payload]` records packed back to back
//! from offset 0. A header with `object == END_MARK` terminates the run; an
//! extent filled to the last byte has no terminator.

use bytemuck::{Pod, Zeroable};
use bytes::{BufMut, BytesMut};
use tracing::warn;

use crate::extent::space::ExtentId;

/// Object id value marking the end of the packed records.
const END_MARK: u32 = u32::MAX;

/// Header written in front of every packed object.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct SlotHeader {
    /// Object id the payload belongs to.
    pub object: u32,
    /// Payload length in bytes.
    pub len: u32,
}

pub const HEADER_LEN: usize = std::mem::size_of::<SlotHeader>();

/// Where an object's record lives on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExtentAddr {
    pub extent: ExtentId,
    /// Offset of the record header inside the extent.
    pub offset: u32,
}

/// One object copied into a staging buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedObject {
    pub object: usize,
    pub offset: u32,
    pub len: u32,
}

/// Staging buffer that packs objects into one extent.
#[derive(Debug)]
pub struct ExtentWriter {
    buf: BytesMut,
    capacity: usize,
    objects: Vec<PackedObject>,
}

impl ExtentWriter {
    pub fn new(extent_size: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(extent_size),
            capacity: extent_size,
            objects: Vec::new(),
        }
    }

    /// Whether a payload of `len` bytes still fits.
    pub fn fits(&self, len: usize) -> bool {
        self.buf.len() + HEADER_LEN + len <= self.capacity
    }

    /// Append a record. Returns the record offset, or `None` when full.
    pub fn push(&mut self, object: usize, payload: &[u8]) -> Option<u32> {
        if !self.fits(payload.len()) {
            return None;
        }
        let offset = self.buf.len() as u32;
        let header = SlotHeader {
            object: object as u32,
            len: payload.len() as u32,
        };
        self.buf.put_slice(bytemuck::bytes_of(&header));
        self.buf.put_slice(payload);
        self.objects.push(PackedObject {
            object,
            offset,
            len: header.len,
        });
        Some(offset)
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Payload bytes packed so far (headers excluded).
    pub fn payload_bytes(&self) -> u64 {
        self.objects.iter().map(|o| u64::from(o.len)).sum()
    }

    pub fn objects(&self) -> &[PackedObject] {
        &self.objects
    }

    /// Terminate and pad to the full extent size.
    pub fn finish(mut self) -> (BytesMut, Vec<PackedObject>) {
        if self.buf.len() + HEADER_LEN <= self.capacity {
            let end = SlotHeader {
                object: END_MARK,
                len: 0,
            };
            self.buf.put_slice(bytemuck::bytes_of(&end));
        }
        self.buf.resize(self.capacity, 0);
        (self.buf, self.objects)
    }
}

/// One record read back from an extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record<'a> {
    pub object: usize,
    pub offset: u32,
    pub payload: &'a [u8],
}

/// Iterate the records of an extent image.
pub fn records(buf: &[u8]) -> Records<'_> {
    Records { buf, pos: 0 }
}

pub struct Records<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for Records<'a> {
    type Item = Record<'a>;

    fn next(&mut self) -> Option<Record<'a>> {
        let header_end = self.pos + HEADER_LEN;
        if header_end > self.buf.len() {
            return None;
        }
        let header: SlotHeader = bytemuck::pod_read_unaligned(&self.buf[self.pos..header_end]);
        if header.object == END_MARK {
            return None;
        }
        let payload_end = header_end + header.len as usize;
        if payload_end > self.buf.len() {
            warn!(
                offset = self.pos,
                len = header.len,
                "Truncated record in extent image"
            );
            return None;
        }
        let record = Record {
            object: header.object as usize,
            offset: self.pos as u32,
            payload: &self.buf[header_end..payload_end],
        };
        self.pos = payload_end;
        Some(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_and_parse() {
        let mut writer = ExtentWriter::new(256);
        assert_eq!(writer.push(7, b"hello"), Some(0));
        assert_eq!(writer.push(9, b"world!"), Some((HEADER_LEN + 5) as u32));
        assert_eq!(writer.payload_bytes(), 11);

        let (buf, packed) = writer.finish();
        assert_eq!(buf.len(), 256);
        assert_eq!(packed.len(), 2);

        let recs: Vec<_> = records(&buf).collect();
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].object, 7);
        assert_eq!(recs[0].payload, b"hello");
        assert_eq!(recs[1].object, 9);
        assert_eq!(recs[1].offset, packed[1].offset);
        assert_eq!(recs[1].payload, b"world!");
    }

    #[test]
    fn test_full_extent_without_terminator() {
        let mut writer = ExtentWriter::new(HEADER_LEN + 4);
        assert!(writer.push(1, &[1, 2, 3, 4]).is_some());
        assert!(!writer.fits(0));
        assert!(writer.push(2, &[]).is_none());

        let (buf, _) = writer.finish();
        let recs: Vec<_> = records(&buf).collect();
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].payload, &[1, 2, 3, 4]);
    }

    #[test]
    fn test_empty_extent_has_no_records() {
        let (buf, packed) = ExtentWriter::new(64).finish();
        assert!(packed.is_empty());
        assert_eq!(records(&buf).count(), 0);
    }

    #[test]
    fn test_truncated_record_stops_parsing() {
        let mut buf = vec![0u8; 16];
        let header = SlotHeader {
            object: 3,
            len: 100,
        };
        buf[..HEADER_LEN].copy_from_slice(bytemuck::bytes_of(&header));
        assert_eq!(records(&buf).count(), 0);
    }
}
