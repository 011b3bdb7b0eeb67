use std::collections::BTreeMap;

use bytes::Bytes;

/// Reorders fragments delivered at arbitrary offsets into an in-order byte stream
///
/// Duplicate and overlapping deliveries are tolerated; bytes below the read cursor are
/// discarded on insert, and overlap between stored chunks is resolved when reading.
#[derive(Debug, Default)]
pub struct Assembler {
    data: BTreeMap<u64, Bytes>,
    /// Offset of the next byte to be read
    offset: u64,
}

impl Assembler {
    pub fn new() -> Self {
        Default::default()
    }

    /// The in-order read cursor
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Whether in-order data is available at the cursor
    pub fn has_data(&self) -> bool {
        self.data
            .iter()
            .next()
            .map_or(false, |(&off, _)| off <= self.offset)
    }

    pub fn insert(&mut self, mut offset: u64, mut data: Bytes) {
        if data.is_empty() {
            return;
        }
        let end = offset + data.len() as u64;
        if end <= self.offset {
            // Wholly consumed already
            return;
        }
        if offset < self.offset {
            data = data.split_off((self.offset - offset) as usize);
            offset = self.offset;
        }
        // Don't bother storing data an existing chunk wholly covers
        if let Some((&start, chunk)) = self.data.range(..=offset).next_back() {
            if start + chunk.len() as u64 >= end {
                return;
            }
        }
        self.data.insert(offset, data);
    }

    /// Copy in-order bytes into `buf`, advancing the cursor; returns the number copied
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let mut read = 0;
        while read < buf.len() {
            let (off, mut chunk) = match self.pop_contiguous() {
                Some(x) => x,
                None => break,
            };
            debug_assert!(off <= self.offset);
            let n = (chunk.len()).min(buf.len() - read);
            buf[read..read + n].copy_from_slice(&chunk[..n]);
            read += n;
            self.offset += n as u64;
            if n < chunk.len() {
                let rest = chunk.split_off(n);
                self.data.insert(self.offset, rest);
            }
        }
        read
    }

    /// Take the next contiguous chunk without copying, advancing the cursor
    pub fn read_chunk(&mut self) -> Option<Bytes> {
        let (_, chunk) = self.pop_contiguous()?;
        self.offset += chunk.len() as u64;
        Some(chunk)
    }

    /// Take any stored chunk regardless of ordering, together with its stream offset
    ///
    /// Supports out-of-order consumption; the cursor advances past everything returned so that
    /// in-order reads are not replayed.
    pub fn pop_unordered(&mut self) -> Option<(u64, Bytes)> {
        let (&off, _) = self.data.iter().next()?;
        let chunk = self.data.remove(&off).unwrap();
        let end = off + chunk.len() as u64;
        self.offset = self.offset.max(end);
        Some((off, chunk))
    }

    /// Drop all buffered data, e.g. after a reset
    pub fn clear(&mut self) {
        self.data.clear();
    }

    fn pop_contiguous(&mut self) -> Option<(u64, Bytes)> {
        let (&off, _) = self.data.iter().next()?;
        if off > self.offset {
            return None;
        }
        let mut chunk = self.data.remove(&off).unwrap();
        if off < self.offset {
            // Overlap with already-read or concurrently stored data
            let skip = (self.offset - off) as usize;
            if skip >= chunk.len() {
                return self.pop_contiguous();
            }
            chunk = chunk.split_off(skip);
        }
        Some((self.offset, chunk))
    }
}
