#![forbid(unsafe_code)]
//! Read-only byte device layer.
//!
//! Provides the `ByteDevice` trait consumed by the traversal engine,
//! a file-backed implementation using positional reads, and an in-memory
//! implementation for images already loaded into RAM.
//!
//! Every read is synchronous and exact: a request that extends past the
//! end of the device fails with `XfrError::TruncatedRead` instead of
//! returning a short buffer.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;
use xfr_error::{Result, XfrError};
use xfr_types::ByteOffset;

/// Byte-addressed device for fixed-offset reads (pread semantics).
///
/// Implementations perform no locking of their own beyond what positional
/// reads already guarantee; callers traversing the same device concurrently
/// must not interleave writes from elsewhere.
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()>;
}

impl<D: ByteDevice + ?Sized> ByteDevice for &D {
    fn len_bytes(&self) -> u64 {
        (**self).len_bytes()
    }

    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        (**self).read_exact_at(offset, buf)
    }
}

/// Reject a read of `len` bytes at `offset` that extends past `device_len`.
fn check_range(offset: ByteOffset, len: usize, device_len: u64) -> Result<()> {
    let len_u64 = u64::try_from(len)
        .map_err(|_| XfrError::Format("read length overflows u64".to_owned()))?;
    let end = offset
        .checked_add(len_u64)
        .ok_or_else(|| XfrError::Format("read range overflows u64".to_owned()))?;
    if end.0 > device_len {
        let available = device_len.saturating_sub(offset.0);
        return Err(XfrError::TruncatedRead {
            offset: offset.0,
            needed: len,
            actual: usize::try_from(available).unwrap_or(usize::MAX),
        });
    }
    Ok(())
}

/// File-backed byte device using positional reads.
///
/// This uses `std::os::unix::fs::FileExt`, which is thread-safe and does not
/// require a shared seek position. The file is opened read-only.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len)?;
        self.file.read_exact_at(buf, offset.0)?;
        Ok(())
    }
}

/// In-memory byte device over an owned image.
#[derive(Debug, Clone)]
pub struct MemoryByteDevice {
    bytes: Arc<[u8]>,
}

impl MemoryByteDevice {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }
}

impl ByteDevice for MemoryByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.len()).unwrap_or(u64::MAX)
    }

    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len_bytes())?;
        let start = offset
            .to_usize()
            .map_err(|e| XfrError::Format(e.to_string()))?;
        buf.copy_from_slice(&self.bytes[start..start + buf.len()]);
        Ok(())
    }
}

/// Read `len` bytes at `offset` into a fresh buffer.
pub fn read_region(dev: &dyn ByteDevice, offset: ByteOffset, len: usize) -> Result<Vec<u8>> {
    trace!(offset = offset.0, len, "device read");
    let mut buf = vec![0_u8; len];
    dev.read_exact_at(offset, &mut buf)?;
    Ok(buf)
}
