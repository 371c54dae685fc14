//! Memory-mapped frame slot rings.
//!
//! Each frame channel (stimulus, camera) is one [`FrameRing`]: a
//! memory-mapped file holding a fixed header followed by `slot_count` slots
//! of `slot_size` bytes. The single writer copies each frame into slot
//! `frame_id % slot_count` and hands the `(frame_id, offset, length)` triple
//! to the sideband, where readers in other processes pick it up and read the
//! payload directly out of the mapping.
//!
//! # Loss model
//!
//! The ring is lossy for readers by construction: a reader that falls more
//! than `slot_count` frames behind observes slots that have been overwritten
//! with newer frames. The writer never waits on readers.
//!
//! # Memory layout
//! ```text
//! [128-byte header] [slot 0] [slot 1] ... [slot N-1]
//!
//! Header (cache-line aligned):
//!   magic: u64              (0x1511_DA7A_0000_0001)
//!   slot_size: u64
//!   slot_count: u64
//!   frames_written: AtomicU64
//!   padding: [u8; 96]
//! ```

use crate::error::{IsiError, IsiResult};
use memmap2::{MmapMut, MmapOptions};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Magic number for ring header validation.
const MAGIC: u64 = 0x1511_DA7A_0000_0001;

/// Size of the ring header in bytes.
const HEADER_SIZE: usize = 128;

/// Ring header with a fixed `#[repr(C)]` layout so external readers
/// (renderer-side code in another language) can parse it.
#[repr(C)]
struct RingHeader {
    magic: u64,
    slot_size: u64,
    slot_count: u64,
    /// Total frames written since creation; the next frame id.
    frames_written: AtomicU64,
    _padding: [u8; 96],
}

const _: () = assert!(
    std::mem::size_of::<RingHeader>() == HEADER_SIZE,
    "RingHeader size must equal HEADER_SIZE"
);

/// Location of one written frame inside a ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSlot {
    /// Monotonic frame id assigned by the ring.
    pub frame_id: u64,
    /// Byte offset of the payload from the start of the file.
    pub offset_bytes: u64,
    /// Payload length in bytes.
    pub data_size_bytes: u64,
}

/// A single-writer memory-mapped frame ring.
pub struct FrameRing {
    /// Keeps the mapping alive; all raw pointers below point into it.
    #[allow(dead_code)]
    mmap: MmapMut,

    /// SAFETY: points to the start of `mmap`, valid while `mmap` lives.
    header: *mut RingHeader,

    /// SAFETY: points `HEADER_SIZE` bytes into `mmap`.
    data_ptr: *mut u8,

    slot_size: usize,
    slot_count: usize,
    path: PathBuf,

    /// The design is single-writer per channel; this lock turns an
    /// accidental second writer into serialization instead of a data race.
    write_lock: Mutex<()>,
}

// SAFETY: writes are serialized by `write_lock` and the frame counter uses
// atomic ordering; raw pointers are only dereferenced within the mapping.
#[allow(unsafe_code)]
unsafe impl Send for FrameRing {}
#[allow(unsafe_code)]
unsafe impl Sync for FrameRing {}

impl std::fmt::Debug for FrameRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameRing")
            .field("path", &self.path)
            .field("slot_size", &self.slot_size)
            .field("slot_count", &self.slot_count)
            .field("frames_written", &self.frames_written())
            .finish()
    }
}

#[allow(unsafe_code)]
impl FrameRing {
    /// Create a fresh ring, truncating any previous file at this path.
    pub fn create(path: &Path, slot_size: usize, slot_count: usize) -> IsiResult<Self> {
        if slot_size == 0 || slot_count == 0 {
            return Err(IsiError::PublishFailed(
                "ring slot size and count must be positive".into(),
            ));
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let total = HEADER_SIZE + slot_size * slot_count;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(total as u64)?;

        // SAFETY: the file was just sized to `total` bytes.
        let mut mmap = unsafe { MmapOptions::new().map_mut(&file)? };

        // SAFETY: the mapping is at least HEADER_SIZE bytes.
        let header = mmap.as_mut_ptr() as *mut RingHeader;
        unsafe {
            (*header).magic = MAGIC;
            (*header).slot_size = slot_size as u64;
            (*header).slot_count = slot_count as u64;
            (*header).frames_written = AtomicU64::new(0);
            (*header)._padding.fill(0);
        }

        // SAFETY: offset HEADER_SIZE is within the `total`-byte mapping.
        let data_ptr = unsafe { mmap.as_mut_ptr().add(HEADER_SIZE) };

        Ok(Self {
            mmap,
            header,
            data_ptr,
            slot_size,
            slot_count,
            path: path.to_path_buf(),
            write_lock: Mutex::new(()),
        })
    }

    /// Map an existing ring (reader side, used by tests and diagnostics).
    pub fn open(path: &Path) -> IsiResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        // SAFETY: mapping a file created by `create`.
        let mut mmap = unsafe { MmapOptions::new().map_mut(&file)? };
        if mmap.len() < HEADER_SIZE {
            return Err(IsiError::PublishFailed(format!(
                "ring file too small: {}",
                path.display()
            )));
        }

        let header = mmap.as_mut_ptr() as *mut RingHeader;
        // SAFETY: header layout validated by the magic check below.
        let (magic, slot_size, slot_count) =
            unsafe { ((*header).magic, (*header).slot_size, (*header).slot_count) };
        if magic != MAGIC {
            return Err(IsiError::PublishFailed(format!(
                "bad ring magic in {}: 0x{magic:016X}",
                path.display()
            )));
        }

        // SAFETY: offset HEADER_SIZE is within the mapping (checked above).
        let data_ptr = unsafe { mmap.as_mut_ptr().add(HEADER_SIZE) };

        Ok(Self {
            mmap,
            header,
            data_ptr,
            slot_size: slot_size as usize,
            slot_count: slot_count as usize,
            path: path.to_path_buf(),
            write_lock: Mutex::new(()),
        })
    }

    /// Copy one frame into the next slot and return its location.
    pub fn write_frame(&self, data: &[u8]) -> IsiResult<FrameSlot> {
        if data.len() > self.slot_size {
            return Err(IsiError::PublishFailed(format!(
                "frame of {} bytes exceeds slot size {}",
                data.len(),
                self.slot_size
            )));
        }

        let _guard = match self.write_lock.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };

        // SAFETY: header is valid for the lifetime of self; the destination
        // range [slot_offset, slot_offset + data.len()) lies within one slot
        // of the mapped data region because data.len() <= slot_size and
        // slot_index < slot_count.
        unsafe {
            let id = (*self.header).frames_written.load(Ordering::Acquire);
            let slot_index = (id % self.slot_count as u64) as usize;
            let slot_offset = slot_index * self.slot_size;

            let dest = self.data_ptr.add(slot_offset);
            std::ptr::copy_nonoverlapping(data.as_ptr(), dest, data.len());

            (*self.header).frames_written.store(id + 1, Ordering::Release);

            Ok(FrameSlot {
                frame_id: id,
                offset_bytes: (HEADER_SIZE + slot_offset) as u64,
                data_size_bytes: data.len() as u64,
            })
        }
    }

    /// Read `len` bytes at `offset` (as published on the sideband).
    pub fn read_at(&self, offset_bytes: u64, len: u64) -> IsiResult<Vec<u8>> {
        let offset = offset_bytes as usize;
        let len = len as usize;
        let end = offset.checked_add(len).unwrap_or(usize::MAX);
        if offset < HEADER_SIZE || end > HEADER_SIZE + self.slot_size * self.slot_count {
            return Err(IsiError::PublishFailed(format!(
                "read of {len} bytes at offset {offset} is outside the ring"
            )));
        }

        let mut buffer = vec![0u8; len];
        // SAFETY: the range was bounds-checked against the mapped region.
        unsafe {
            let src = self.data_ptr.add(offset - HEADER_SIZE);
            std::ptr::copy_nonoverlapping(src, buffer.as_mut_ptr(), len);
        }
        Ok(buffer)
    }

    /// Total frames written since creation.
    pub fn frames_written(&self) -> u64 {
        // SAFETY: header is valid for the lifetime of self.
        unsafe { (*self.header).frames_written.load(Ordering::Acquire) }
    }

    /// Payload capacity of one slot.
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Number of slots.
    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    /// Path of the backing file (published as `shm_path`).
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn create_initializes_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stimulus_frames.shm");
        let ring = FrameRing::create(&path, 64, 8).unwrap();
        assert_eq!(ring.frames_written(), 0);
        assert_eq!(ring.slot_size(), 64);
        assert_eq!(ring.slot_count(), 8);
    }

    #[test]
    fn write_assigns_monotonic_ids_and_wrapping_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ring.shm");
        let ring = FrameRing::create(&path, 16, 4).unwrap();

        let mut offsets = Vec::new();
        for i in 0..6u8 {
            let slot = ring.write_frame(&[i; 16]).unwrap();
            assert_eq!(slot.frame_id, i as u64);
            offsets.push(slot.offset_bytes);
        }
        // Slot 0 reused at frame 4.
        assert_eq!(offsets[0], offsets[4]);
        assert_eq!(offsets[1], offsets[5]);
        assert_ne!(offsets[0], offsets[1]);
    }

    #[test]
    fn payload_round_trips_through_reader_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ring.shm");
        let ring = FrameRing::create(&path, 32, 4).unwrap();

        let payload: Vec<u8> = (0u8..32).collect();
        let slot = ring.write_frame(&payload).unwrap();

        let reader = FrameRing::open(&path).unwrap();
        let back = reader
            .read_at(slot.offset_bytes, slot.data_size_bytes)
            .unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ring = FrameRing::create(&dir.path().join("r.shm"), 8, 2).unwrap();
        assert!(ring.write_frame(&[0u8; 9]).is_err());
    }

    #[test]
    fn create_truncates_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ring.shm");
        {
            let ring = FrameRing::create(&path, 16, 2).unwrap();
            ring.write_frame(&[7u8; 16]).unwrap();
        }
        let ring = FrameRing::create(&path, 16, 2).unwrap();
        assert_eq!(ring.frames_written(), 0);
    }

    #[test]
    fn writer_never_blocks_on_slow_reader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ring.shm");
        let ring = Arc::new(FrameRing::create(&path, 1024, 4).unwrap());

        let writer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                for i in 0..1000u32 {
                    ring.write_frame(&i.to_le_bytes()).unwrap();
                }
            })
        };

        // A "reader" that never consumes anything.
        writer.join().unwrap();
        assert_eq!(ring.frames_written(), 1000);
    }
}
