//! Growable byte buffer with owned and shared storage modes.
//!
//! `MemoryChunk` is the backing container for every byte-packed structure in
//! this crate (phrase items, sub-index buffers, single-gram rows). It has two
//! modes:
//!
//! - **owned**: a plain `Vec<u8>`, grown by doubling (or to the requested
//!   size, whichever is larger) with new bytes zero-filled;
//! - **shared**: a window into an `Arc<Vec<u8>>`, used for buffers loaded
//!   from a file and for sub-slices of a parent chunk. Any mutating or
//!   size-changing operation first copies the window into an owned buffer.
//!
//! Multi-byte accessors are little-endian and unaligned; records inside a
//! chunk are packed with no padding.

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use crate::error::{CoreError, Result};

#[derive(Debug, Clone)]
enum Data {
    Owned(Vec<u8>),
    Shared {
        buf: Arc<Vec<u8>>,
        start: usize,
        len: usize,
    },
}

#[derive(Debug, Clone)]
pub struct MemoryChunk {
    data: Data,
}

impl Default for MemoryChunk {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryChunk {
    /// Create an empty owned chunk.
    pub fn new() -> Self {
        MemoryChunk {
            data: Data::Owned(Vec::new()),
        }
    }

    /// Create an owned chunk from an existing byte vector.
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        MemoryChunk {
            data: Data::Owned(bytes),
        }
    }

    /// Bind this chunk to a window of an externally owned buffer.
    ///
    /// The chunk becomes a non-owning view; the first mutation copies the
    /// window out into an owned buffer.
    pub fn set_chunk(&mut self, buf: Arc<Vec<u8>>, start: usize, len: usize) -> Result<()> {
        if start + len > buf.len() {
            return Err(CoreError::Range(format!(
                "chunk window {}..{} exceeds buffer of {} bytes",
                start,
                start + len,
                buf.len()
            )));
        }
        self.data = Data::Shared { buf, start, len };
        Ok(())
    }

    /// A non-owning view of a sub-range of this chunk.
    ///
    /// Shared chunks hand out windows over the same backing buffer; owned
    /// chunks copy the range (views are read-only snapshots either way, since
    /// every mutating path goes through copy-on-write).
    pub fn get_sub_chunk(&self, offset: usize, len: usize) -> Result<MemoryChunk> {
        if offset + len > self.size() {
            return Err(CoreError::Range(format!(
                "sub-chunk {}..{} exceeds chunk of {} bytes",
                offset,
                offset + len,
                self.size()
            )));
        }
        match &self.data {
            Data::Shared { buf, start, .. } => {
                let mut sub = MemoryChunk::new();
                sub.set_chunk(Arc::clone(buf), start + offset, len)?;
                Ok(sub)
            }
            Data::Owned(vec) => Ok(MemoryChunk::from_vec(vec[offset..offset + len].to_vec())),
        }
    }

    pub fn size(&self) -> usize {
        match &self.data {
            Data::Owned(vec) => vec.len(),
            Data::Shared { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn capacity(&self) -> usize {
        match &self.data {
            Data::Owned(vec) => vec.capacity(),
            Data::Shared { len, .. } => *len,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.data {
            Data::Owned(vec) => vec,
            Data::Shared { buf, start, len } => &buf[*start..*start + *len],
        }
    }

    /// Mutable access; upgrades a shared chunk to an owned copy first.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.ensure_owned();
        match &mut self.data {
            Data::Owned(vec) => vec,
            Data::Shared { .. } => unreachable!("ensure_owned upgrades shared chunks"),
        }
    }

    fn ensure_owned(&mut self) {
        if let Data::Shared { buf, start, len } = &self.data {
            let copy = buf[*start..*start + *len].to_vec();
            self.data = Data::Owned(copy);
        }
    }

    /// Owned-mode growth: double the capacity or grow to the requested size,
    /// whichever is larger.
    fn reserve_to(vec: &mut Vec<u8>, need: usize) {
        let cap = vec.capacity();
        if need > cap {
            let target = need.max(cap * 2);
            vec.reserve(target - vec.len());
        }
    }

    /// Extend or truncate; new bytes are zero-filled.
    pub fn set_size(&mut self, newsize: usize) {
        self.ensure_owned();
        if let Data::Owned(vec) = &mut self.data {
            if newsize > vec.len() {
                Self::reserve_to(vec, newsize);
            }
            vec.resize(newsize, 0);
        }
    }

    /// Overwrite bytes at `offset`, extending the chunk if needed and
    /// zero-filling any gap between the old end and `offset`.
    pub fn set_content(&mut self, offset: usize, data: &[u8]) {
        self.ensure_owned();
        if let Data::Owned(vec) = &mut self.data {
            let end = offset + data.len();
            if end > vec.len() {
                Self::reserve_to(vec, end);
                vec.resize(end, 0);
            }
            vec[offset..end].copy_from_slice(data);
        }
    }

    /// Append bytes at the current end.
    pub fn append_content(&mut self, data: &[u8]) {
        self.set_content(self.size(), data);
    }

    /// Insert bytes at `offset`, shifting the tail right.
    pub fn insert_content(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        if offset > self.size() {
            return Err(CoreError::Range(format!(
                "insert at {} beyond chunk of {} bytes",
                offset,
                self.size()
            )));
        }
        self.ensure_owned();
        if let Data::Owned(vec) = &mut self.data {
            Self::reserve_to(vec, vec.len() + data.len());
            vec.splice(offset..offset, data.iter().copied());
        }
        Ok(())
    }

    /// Remove `len` bytes at `offset`, shifting the tail left.
    pub fn remove_content(&mut self, offset: usize, len: usize) -> Result<()> {
        if offset + len > self.size() {
            return Err(CoreError::Range(format!(
                "remove {}..{} beyond chunk of {} bytes",
                offset,
                offset + len,
                self.size()
            )));
        }
        self.ensure_owned();
        if let Data::Owned(vec) = &mut self.data {
            vec.drain(offset..offset + len);
        }
        Ok(())
    }

    /// Copy bytes out of the chunk; fails if the range exceeds the size.
    pub fn get_content(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        if offset + out.len() > self.size() {
            return Err(CoreError::Range(format!(
                "read {}..{} beyond chunk of {} bytes",
                offset,
                offset + out.len(),
                self.size()
            )));
        }
        out.copy_from_slice(&self.as_slice()[offset..offset + out.len()]);
        Ok(())
    }

    pub fn get_u8(&self, offset: usize) -> Result<u8> {
        let mut b = [0u8; 1];
        self.get_content(offset, &mut b)?;
        Ok(b[0])
    }

    pub fn get_u16(&self, offset: usize) -> Result<u16> {
        let mut b = [0u8; 2];
        self.get_content(offset, &mut b)?;
        Ok(u16::from_le_bytes(b))
    }

    pub fn get_u32(&self, offset: usize) -> Result<u32> {
        let mut b = [0u8; 4];
        self.get_content(offset, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    pub fn set_u8(&mut self, offset: usize, v: u8) {
        self.set_content(offset, &[v]);
    }

    pub fn set_u16(&mut self, offset: usize, v: u16) {
        self.set_content(offset, &v.to_le_bytes());
    }

    pub fn set_u32(&mut self, offset: usize, v: u32) {
        self.set_content(offset, &v.to_le_bytes());
    }

    /// Shrink an owned chunk's capacity down to its size. No-op for shared
    /// chunks.
    pub fn compact(&mut self) {
        if let Data::Owned(vec) = &mut self.data {
            vec.shrink_to_fit();
        }
    }

    /// Read a file into a chunk.
    ///
    /// The content is held behind an `Arc` so sub-chunks of a loaded image
    /// can share the allocation; the chunk upgrades to an owned copy on the
    /// first mutation.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<MemoryChunk> {
        let bytes = std::fs::read(path)?;
        let len = bytes.len();
        let mut chunk = MemoryChunk::new();
        chunk.set_chunk(Arc::new(bytes), 0, len)?;
        Ok(chunk)
    }

    /// Write the chunk's bytes to a file and sync.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut file = File::create(path)?;
        file.write_all(self.as_slice())?;
        file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(tag: &str) -> std::path::PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!(
            "libhanyu_chunk_{}_{}.bin",
            tag,
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        p
    }

    #[test]
    fn set_content_extends_and_zero_fills() {
        let mut c = MemoryChunk::new();
        c.set_content(4, &[0xAA, 0xBB]);
        assert_eq!(c.size(), 6);
        assert_eq!(c.as_slice(), &[0, 0, 0, 0, 0xAA, 0xBB]);
    }

    #[test]
    fn insert_and_remove_shift_the_tail() {
        let mut c = MemoryChunk::from_vec(vec![1, 2, 5, 6]);
        c.insert_content(2, &[3, 4]).unwrap();
        assert_eq!(c.as_slice(), &[1, 2, 3, 4, 5, 6]);
        c.remove_content(1, 3).unwrap();
        assert_eq!(c.as_slice(), &[1, 5, 6]);
        assert!(c.insert_content(10, &[0]).is_err());
        assert!(c.remove_content(2, 5).is_err());
    }

    #[test]
    fn get_content_rejects_out_of_range_reads() {
        let c = MemoryChunk::from_vec(vec![1, 2, 3]);
        let mut out = [0u8; 2];
        assert!(c.get_content(1, &mut out).is_ok());
        assert_eq!(out, [2, 3]);
        assert!(matches!(
            c.get_content(2, &mut out),
            Err(CoreError::Range(_))
        ));
    }

    #[test]
    fn shared_chunk_copies_on_write() {
        let backing = Arc::new(vec![10u8, 20, 30, 40]);
        let mut c = MemoryChunk::new();
        c.set_chunk(Arc::clone(&backing), 1, 3).unwrap();
        assert_eq!(c.as_slice(), &[20, 30, 40]);

        c.set_u8(0, 99);
        assert_eq!(c.as_slice(), &[99, 30, 40]);
        // the backing buffer is untouched
        assert_eq!(&backing[..], &[10, 20, 30, 40]);
    }

    #[test]
    fn sub_chunk_shares_a_loaded_buffer() {
        let backing = Arc::new(vec![0u8, 1, 2, 3, 4, 5]);
        let mut parent = MemoryChunk::new();
        parent.set_chunk(backing, 0, 6).unwrap();
        let sub = parent.get_sub_chunk(2, 3).unwrap();
        assert_eq!(sub.as_slice(), &[2, 3, 4]);
        assert!(parent.get_sub_chunk(4, 4).is_err());
    }

    #[test]
    fn typed_accessors_are_little_endian() {
        let mut c = MemoryChunk::new();
        c.set_u32(0, 0x0403_0201);
        c.set_u16(4, 0x0605);
        assert_eq!(c.as_slice(), &[1, 2, 3, 4, 5, 6]);
        assert_eq!(c.get_u32(0).unwrap(), 0x0403_0201);
        assert_eq!(c.get_u16(4).unwrap(), 0x0605);
    }

    #[test]
    fn save_then_load_round_trips() {
        let path = temp_path("roundtrip");
        let mut c = MemoryChunk::new();
        c.set_content(0, b"sentence data");
        c.save(&path).unwrap();

        let loaded = MemoryChunk::load(&path).unwrap();
        assert_eq!(loaded.as_slice(), c.as_slice());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn set_size_grows_zero_filled_and_truncates() {
        let mut c = MemoryChunk::from_vec(vec![7, 8]);
        c.set_size(5);
        assert_eq!(c.as_slice(), &[7, 8, 0, 0, 0]);
        c.set_size(1);
        assert_eq!(c.as_slice(), &[7]);
        c.compact();
        assert_eq!(c.size(), 1);
    }
}
