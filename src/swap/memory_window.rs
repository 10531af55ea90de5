//! Sliding memory-mapped window over the swap file
//!
//! Only a small part of the swap file is mapped at any time. Reads and
//! writes each get their own window so that a swap-in does not evict the
//! mapping a following swap-out is about to reuse.
//!
//! ```text
//! swap file:  |----|----|----|----|----|----|----|
//!                   ^^^^^^^^^^       ^^^^^
//!                   write window     read window
//! ```
//!
//! A window starts at a multiple of the window size. A chunk larger than
//! the window gets a window stretched to cover it.

use super::chunk::Chunk;
use crate::error::{Error, Result};
use memmap2::{Mmap, MmapMut, MmapOptions};
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// Memory-mapped view of the swap file
pub struct MemoryWindow {
    // Maps are declared before the file so they are unmapped first on drop.
    read_window: Option<(u64, Mmap)>,
    write_window: Option<(u64, MmapMut)>,
    file: NamedTempFile,
    window_size: u64,
    file_len: u64,
    valid_len: u64,
    #[cfg(test)]
    pub(crate) fail_next_write: bool,
}

impl MemoryWindow {
    /// Create a swap file in `swap_dir` and prepare an empty window
    pub fn new<P: AsRef<Path>>(swap_dir: P, window_size: u64) -> Result<Self> {
        if window_size == 0 {
            return Err(Error::InvalidArgument(
                "swap window size must be non-zero".to_string(),
            ));
        }

        let swap_dir = swap_dir.as_ref();
        std::fs::create_dir_all(swap_dir)?;

        let file = tempfile::Builder::new()
            .prefix("tilevault-")
            .suffix(".swap")
            .tempfile_in(swap_dir)?;

        info!(path = ?file.path(), window_size, "Created swap file");

        Ok(Self {
            read_window: None,
            write_window: None,
            file,
            window_size,
            file_len: 0,
            valid_len: 0,
            #[cfg(test)]
            fail_next_write: false,
        })
    }

    #[cfg(test)]
    fn take_write_failure(&mut self) -> bool {
        std::mem::take(&mut self.fail_next_write)
    }

    #[cfg(not(test))]
    fn take_write_failure(&mut self) -> bool {
        false
    }

    /// Writable bytes of `chunk`
    ///
    /// The file is grown when the chunk lies beyond its current end. The
    /// slice borrows the window, so it cannot outlive the next remap.
    pub fn get_write_chunk(&mut self, chunk: Chunk) -> Result<&mut [u8]> {
        if chunk.is_null() {
            return Err(Error::InvalidArgument(
                "cannot write the null chunk".to_string(),
            ));
        }
        if self.take_write_failure() {
            return Err(Error::Io(std::io::Error::other("injected write failure")));
        }

        let covered = matches!(
            &self.write_window,
            Some((start, map)) if covers(*start, map.len(), chunk)
        );

        if !covered {
            let (start, len) = self.window_for(chunk);
            if start + len > self.file_len {
                self.file.as_file().set_len(start + len)?;
                debug!(from = self.file_len, to = start + len, "Grew swap file");
                self.file_len = start + len;
            }

            self.write_window = None;
            // SAFETY: the swap file is a private temporary owned by this
            // struct and only ever grows, so the mapped range stays backed.
            let map = unsafe {
                MmapOptions::new()
                    .offset(start)
                    .len(len as usize)
                    .map_mut(self.file.as_file())?
            };
            debug!(start, len, "Remapped swap write window");
            self.write_window = Some((start, map));
        }

        self.valid_len = self.valid_len.max(chunk.end());

        let (start, map) = self
            .write_window
            .as_mut()
            .ok_or_else(|| Error::InvalidState("write window not mapped".to_string()))?;
        let lo = (chunk.offset - *start) as usize;
        Ok(&mut map[lo..lo + chunk.size as usize])
    }

    /// Readable bytes of `chunk`
    ///
    /// Fails when the chunk reaches past the part of the file that has ever
    /// been written.
    pub fn get_read_chunk(&mut self, chunk: Chunk) -> Result<&[u8]> {
        if chunk.is_null() || chunk.end() > self.valid_len {
            return Err(Error::ChunkOutOfRange {
                offset: chunk.offset,
                size: chunk.size,
                valid_len: self.valid_len,
            });
        }

        let covered = matches!(
            &self.read_window,
            Some((start, map)) if covers(*start, map.len(), chunk)
        );

        if !covered {
            let (start, len) = self.window_for(chunk);
            let len = len.min(self.file_len - start);

            self.read_window = None;
            // SAFETY: see `get_write_chunk`; the range lies inside the file.
            let map = unsafe {
                MmapOptions::new()
                    .offset(start)
                    .len(len as usize)
                    .map(self.file.as_file())?
            };
            debug!(start, len, "Remapped swap read window");
            self.read_window = Some((start, map));
        }

        let (start, map) = self
            .read_window
            .as_ref()
            .ok_or_else(|| Error::InvalidState("read window not mapped".to_string()))?;
        let lo = (chunk.offset - *start) as usize;
        Ok(&map[lo..lo + chunk.size as usize])
    }

    fn window_for(&self, chunk: Chunk) -> (u64, u64) {
        let start = chunk.offset / self.window_size * self.window_size;
        let end = (start + self.window_size).max(chunk.end());
        (start, end - start)
    }

    /// Path of the swap file
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Current length of the swap file
    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    /// End of the region that has ever been written
    pub fn valid_len(&self) -> u64 {
        self.valid_len
    }

    /// Configured window size
    pub fn window_size(&self) -> u64 {
        self.window_size
    }
}

fn covers(start: u64, len: usize, chunk: Chunk) -> bool {
    chunk.offset >= start && chunk.end() <= start + len as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_write_then_read() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut window = MemoryWindow::new(dir.path(), 4096)?;

        let chunk = Chunk::new(100, 11);
        window.get_write_chunk(chunk)?.copy_from_slice(b"hello swap!");
        assert_eq!(window.get_read_chunk(chunk)?, b"hello swap!");
        assert_eq!(window.file_len(), 4096);
        Ok(())
    }

    #[test]
    fn test_window_remaps_and_grows() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut window = MemoryWindow::new(dir.path(), 4096)?;

        let near = Chunk::new(0, 4);
        let far = Chunk::new(3 * 4096 + 10, 4);
        window.get_write_chunk(near)?.copy_from_slice(&[1, 2, 3, 4]);
        window.get_write_chunk(far)?.copy_from_slice(&[5, 6, 7, 8]);

        assert_eq!(window.file_len(), 4 * 4096);
        assert_eq!(window.get_read_chunk(near)?, &[1, 2, 3, 4]);
        assert_eq!(window.get_read_chunk(far)?, &[5, 6, 7, 8]);
        Ok(())
    }

    #[test]
    fn test_window_stretches_for_large_chunk() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut window = MemoryWindow::new(dir.path(), 1024)?;

        let big = Chunk::new(1000, 5000);
        let data: Vec<u8> = (0..5000).map(|i| (i % 251) as u8).collect();
        window.get_write_chunk(big)?.copy_from_slice(&data);

        assert_eq!(window.get_read_chunk(big)?, &data[..]);
        Ok(())
    }

    #[test]
    fn test_window_rejects_unwritten_read() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut window = MemoryWindow::new(dir.path(), 4096)?;

        window.get_write_chunk(Chunk::new(0, 16))?.fill(7);
        assert!(matches!(
            window.get_read_chunk(Chunk::new(8, 16)),
            Err(Error::ChunkOutOfRange { .. })
        ));
        assert!(window.get_read_chunk(Chunk::NULL).is_err());
        Ok(())
    }

    #[test]
    fn test_swap_file_removed_on_drop() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = {
            let window = MemoryWindow::new(dir.path(), 4096)?;
            window.path().to_path_buf()
        };
        assert!(!path.exists());
        Ok(())
    }
}
