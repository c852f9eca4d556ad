//! # Random-Access Files
//!
//! Positional byte I/O over one open file handle. This is the seam the
//! rest of the storage layer builds on: the cache loaders, the log writer
//! queue and the disk service all talk to [`RandomAccess`], and tests slot
//! fault-injecting implementations in behind the same trait.
//!
//! ## Contract
//!
//! | Operation          | Semantics                                        |
//! |--------------------|--------------------------------------------------|
//! | `len` / `set_len`  | query / truncate-or-extend the file              |
//! | `read_at`          | positional read, may be short at EOF             |
//! | `write_at`         | positional write-all, may extend the file        |
//! | vectored variants  | gather/scatter over a list of buffers            |
//! | `sync`             | durability barrier for all prior writes          |
//!
//! Concurrent positional reads and writes to *disjoint* ranges through a
//! shared handle are supported (`&self` throughout); overlapping writes
//! are the caller's problem. `sync` orders against every write issued
//! before it on this handle.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use eyre::{Result, WrapErr};
use smallvec::SmallVec;

/// Positional I/O over one open handle.
pub trait RandomAccess: Send + Sync {
    /// Current byte length of the file.
    fn len(&self) -> Result<u64>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Truncates or extends the file to `len` bytes.
    fn set_len(&self, len: u64) -> Result<()>;

    /// Reads into `buf` at `offset`, returning the bytes read. A short
    /// count only occurs at end of file.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Writes all of `buf` at `offset`, extending the file if needed.
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<()>;

    /// Scatter read into consecutive buffers starting at `offset`.
    /// Returns total bytes read; short only at end of file.
    fn read_vectored_at(&self, bufs: &mut [&mut [u8]], offset: u64) -> Result<usize> {
        let mut total = 0usize;
        for buf in bufs {
            let read = self.read_at(buf, offset + total as u64)?;
            total += read;
            if read < buf.len() {
                break;
            }
        }
        Ok(total)
    }

    /// Gather write of consecutive buffers starting at `offset`.
    fn write_vectored_at(&self, bufs: &[&[u8]], offset: u64) -> Result<()> {
        let mut written = 0u64;
        for buf in bufs {
            self.write_at(buf, offset + written)?;
            written += buf.len() as u64;
        }
        Ok(())
    }

    /// Makes every prior write on this handle durable.
    fn sync(&self) -> Result<()>;

    /// Hints that the file is about to be scanned front to back.
    fn advise_sequential(&self) {}

    /// Fills `buf` completely from `offset`, zero-filling whatever lies
    /// past end of file. Page readers probe virtual offsets the physical
    /// file may not have reached yet.
    fn read_page_into(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let mut filled = 0usize;
        while filled < buf.len() {
            let read = self.read_at(&mut buf[filled..], offset + filled as u64)?;
            if read == 0 {
                buf[filled..].fill(0);
                break;
            }
            filled += read;
        }
        Ok(())
    }
}

/// [`RandomAccess`] over a plain [`std::fs::File`].
#[derive(Debug)]
pub struct RandomAccessFile {
    file: File,
    path: PathBuf,
}

impl RandomAccessFile {
    /// Opens `path` for positional I/O. Read-write mode creates the file
    /// when missing; read-only mode requires it to exist.
    pub fn open<P: AsRef<Path>>(path: P, read_only: bool) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(!read_only)
            .open(path)
            .wrap_err_with(|| format!("failed to open file '{}'", path.display()))?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RandomAccess for RandomAccessFile {
    fn len(&self) -> Result<u64> {
        let metadata = self
            .file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", self.path.display()))?;
        Ok(metadata.len())
    }

    fn set_len(&self, len: u64) -> Result<()> {
        self.file
            .set_len(len)
            .wrap_err_with(|| format!("failed to set '{}' to {} bytes", self.path.display(), len))
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        loop {
            match self.file.read_at(buf, offset) {
                Ok(read) => return Ok(read),
                Err(error) if error.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(error) => {
                    return Err(error).wrap_err_with(|| {
                        format!("failed to read '{}' at {}", self.path.display(), offset)
                    })
                }
            }
        }
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        self.file.write_all_at(buf, offset).wrap_err_with(|| {
            format!("failed to write '{}' at {}", self.path.display(), offset)
        })
    }

    fn read_vectored_at(&self, bufs: &mut [&mut [u8]], offset: u64) -> Result<usize> {
        let mut total = 0usize;
        let mut remaining: SmallVec<[&mut [u8]; 8]> = bufs
            .iter_mut()
            .map(|buf| &mut **buf)
            .filter(|buf| !buf.is_empty())
            .collect();

        while !remaining.is_empty() {
            let iov: SmallVec<[libc::iovec; 8]> = remaining
                .iter_mut()
                .map(|buf| libc::iovec {
                    iov_base: buf.as_mut_ptr() as *mut libc::c_void,
                    iov_len: buf.len(),
                })
                .collect();

            // SAFETY: each iovec points into a live &mut [u8] from
            // `remaining`; preadv writes at most iov_len bytes into each.
            let read = unsafe {
                libc::preadv(
                    self.file.as_raw_fd(),
                    iov.as_ptr(),
                    iov.len() as libc::c_int,
                    (offset + total as u64) as libc::off_t,
                )
            };

            if read < 0 {
                let error = std::io::Error::last_os_error();
                if error.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(error).wrap_err_with(|| {
                    format!("failed vectored read of '{}' at {}", self.path.display(), offset)
                });
            }
            if read == 0 {
                break;
            }

            total += read as usize;
            advance_mut(&mut remaining, read as usize);
        }

        Ok(total)
    }

    fn write_vectored_at(&self, bufs: &[&[u8]], offset: u64) -> Result<()> {
        let mut written = 0usize;
        let mut remaining: SmallVec<[&[u8]; 8]> = bufs
            .iter()
            .copied()
            .filter(|buf| !buf.is_empty())
            .collect();

        while !remaining.is_empty() {
            let iov: SmallVec<[libc::iovec; 8]> = remaining
                .iter()
                .map(|buf| libc::iovec {
                    iov_base: buf.as_ptr() as *mut libc::c_void,
                    iov_len: buf.len(),
                })
                .collect();

            // SAFETY: each iovec points into a live &[u8] from `remaining`;
            // pwritev only reads from them.
            let wrote = unsafe {
                libc::pwritev(
                    self.file.as_raw_fd(),
                    iov.as_ptr(),
                    iov.len() as libc::c_int,
                    (offset + written as u64) as libc::off_t,
                )
            };

            if wrote < 0 {
                let error = std::io::Error::last_os_error();
                if error.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(error).wrap_err_with(|| {
                    format!("failed vectored write of '{}' at {}", self.path.display(), offset)
                });
            }

            written += wrote as usize;
            advance(&mut remaining, wrote as usize);
        }

        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file
            .sync_all()
            .wrap_err_with(|| format!("failed to sync '{}'", self.path.display()))
    }

    fn advise_sequential(&self) {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        // SAFETY: fadvise is a pure kernel hint on a valid fd; it touches
        // no user memory.
        unsafe {
            libc::posix_fadvise(self.file.as_raw_fd(), 0, 0, libc::POSIX_FADV_SEQUENTIAL);
        }
    }
}

fn advance(remaining: &mut SmallVec<[&[u8]; 8]>, mut count: usize) {
    while count > 0 {
        if count >= remaining[0].len() {
            count -= remaining[0].len();
            remaining.remove(0);
        } else {
            let head = remaining[0];
            remaining[0] = &head[count..];
            count = 0;
        }
    }
}

fn advance_mut<'a>(remaining: &mut SmallVec<[&'a mut [u8]; 8]>, mut count: usize) {
    while count > 0 {
        if count >= remaining[0].len() {
            count -= remaining[0].len();
            remaining.remove(0);
        } else {
            let rest = std::mem::take(&mut remaining[0]);
            remaining[0] = rest.split_at_mut(count).1;
            count = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let file = RandomAccessFile::open(dir.path().join("io.bin"), false).unwrap();

        file.write_at(b"hello", 100).unwrap();

        let mut buf = [0u8; 5];
        assert_eq!(file.read_at(&mut buf, 100).unwrap(), 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(file.len().unwrap(), 105);
    }

    #[test]
    fn read_at_is_short_at_end_of_file() {
        let dir = tempdir().unwrap();
        let file = RandomAccessFile::open(dir.path().join("io.bin"), false).unwrap();
        file.write_at(b"abc", 0).unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(file.read_at(&mut buf, 0).unwrap(), 3);
        assert_eq!(file.read_at(&mut buf, 10).unwrap(), 0);
    }

    #[test]
    fn read_page_into_zero_fills_past_end_of_file() {
        let dir = tempdir().unwrap();
        let file = RandomAccessFile::open(dir.path().join("io.bin"), false).unwrap();
        file.write_at(&[0xAA; 4], 0).unwrap();

        let mut buf = [0xFFu8; 16];
        file.read_page_into(&mut buf, 0).unwrap();
        assert_eq!(&buf[..4], &[0xAA; 4]);
        assert_eq!(&buf[4..], &[0u8; 12]);
    }

    #[test]
    fn set_len_truncates_and_extends() {
        let dir = tempdir().unwrap();
        let file = RandomAccessFile::open(dir.path().join("io.bin"), false).unwrap();
        file.write_at(&[1u8; 64], 0).unwrap();

        file.set_len(16).unwrap();
        assert_eq!(file.len().unwrap(), 16);

        file.set_len(128).unwrap();
        assert_eq!(file.len().unwrap(), 128);

        let mut buf = [9u8; 8];
        file.read_at(&mut buf, 64).unwrap();
        assert_eq!(buf, [0u8; 8]);
    }

    #[test]
    fn vectored_write_gathers_in_order() {
        let dir = tempdir().unwrap();
        let file = RandomAccessFile::open(dir.path().join("io.bin"), false).unwrap();

        let parts: [&[u8]; 3] = [b"one", b"-two-", b"three"];
        file.write_vectored_at(&parts, 8).unwrap();

        let mut buf = [0u8; 13];
        assert_eq!(file.read_at(&mut buf, 8).unwrap(), 13);
        assert_eq!(&buf, b"one-two-three");
    }

    #[test]
    fn vectored_read_scatters_in_order() {
        let dir = tempdir().unwrap();
        let file = RandomAccessFile::open(dir.path().join("io.bin"), false).unwrap();
        file.write_at(b"abcdefgh", 0).unwrap();

        let mut first = [0u8; 3];
        let mut second = [0u8; 5];
        let mut bufs: [&mut [u8]; 2] = [&mut first, &mut second];
        assert_eq!(file.read_vectored_at(&mut bufs, 0).unwrap(), 8);
        assert_eq!(&first, b"abc");
        assert_eq!(&second, b"defgh");
    }

    #[test]
    fn read_only_mode_rejects_missing_files() {
        let dir = tempdir().unwrap();
        assert!(RandomAccessFile::open(dir.path().join("absent.bin"), true).is_err());
    }

    #[test]
    fn concurrent_disjoint_writes_land() {
        let dir = tempdir().unwrap();
        let file =
            std::sync::Arc::new(RandomAccessFile::open(dir.path().join("io.bin"), false).unwrap());

        let handles: Vec<_> = (0..4u8)
            .map(|i| {
                let file = std::sync::Arc::clone(&file);
                std::thread::spawn(move || {
                    file.write_at(&[i; 512], i as u64 * 512).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for i in 0..4u8 {
            let mut buf = [0u8; 512];
            file.read_at(&mut buf, i as u64 * 512).unwrap();
            assert!(buf.iter().all(|&b| b == i));
        }
    }
}
