//! File-backed persistent-memory image.
//!
//! The image mirrors the traced PM mapping byte for byte: a store to virtual
//! address `a` lands at file offset `a - base`.

use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use pmcheck_error::{PmcheckError, Result};
use pmcheck_types::AddrRange;
use tracing::debug;

#[derive(Debug)]
pub struct PmImage {
    path: PathBuf,
    file: File,
    base: u64,
    len: u64,
}

impl PmImage {
    /// Create (or truncate) a zero-filled image of `len` bytes.
    pub fn create(path: &Path, base: u64, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len)?;
        debug!(path = %path.display(), base = format_args!("{base:#x}"), len, "image created");
        Ok(Self {
            path: path.to_path_buf(),
            file,
            base,
            len,
        })
    }

    /// Open an existing image; its length is the file length.
    pub fn open(path: &Path, base: u64) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            file,
            base,
            len,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub const fn base(&self) -> u64 {
        self.base
    }

    pub const fn len(&self) -> u64 {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn offset_of(&self, range: AddrRange) -> Result<u64> {
        let out_of_bounds = || PmcheckError::ImageOutOfBounds {
            address: range.address,
            size: range.size,
            image_len: self.len,
        };
        let offset = range.address.checked_sub(self.base).ok_or_else(out_of_bounds)?;
        match offset.checked_add(range.size) {
            Some(end) if end <= self.len => Ok(offset),
            _ => Err(out_of_bounds()),
        }
    }

    /// Write `bytes` at the image location of `range`.
    pub fn write_store(&mut self, range: AddrRange, bytes: &[u8]) -> Result<()> {
        if bytes.len() as u64 != range.size {
            return Err(PmcheckError::internal(format!(
                "store {range} carries {} bytes",
                bytes.len()
            )));
        }
        let offset = self.offset_of(range)?;
        let mut total = 0_usize;
        while total < bytes.len() {
            let off = offset + total as u64;
            let n = self.file.write_at(&bytes[total..], off)?;
            if n == 0 {
                return Err(PmcheckError::Io(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "image write_at returned 0",
                )));
            }
            total += n;
        }
        Ok(())
    }

    /// Read the image bytes under `range`.
    pub fn read(&self, range: AddrRange) -> Result<Vec<u8>> {
        let offset = self.offset_of(range)?;
        #[allow(clippy::cast_possible_truncation)]
        let mut buf = vec![0_u8; range.size as usize];
        let mut total = 0_usize;
        while total < buf.len() {
            let off = offset + total as u64;
            let n = self.file.read_at(&mut buf[total..], off)?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(buf)
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Sync, then copy the image to `dest` and open the copy.
    pub fn copy_to(&self, dest: &Path) -> Result<Self> {
        self.sync()?;
        fs::copy(&self.path, dest)?;
        Self::open(dest, self.base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: u64 = 0x1_0000_0000;

    #[test]
    fn write_translates_by_base() {
        let dir = tempfile::tempdir().unwrap();
        let mut image = PmImage::create(&dir.path().join("pm"), BASE, 4096).unwrap();
        image
            .write_store(AddrRange::new(BASE + 0x10, 4), b"ABCD")
            .unwrap();
        image.write_store(AddrRange::new(BASE + 0x11, 2), b"BB").unwrap();
        let got = image.read(AddrRange::new(BASE + 0x10, 4)).unwrap();
        assert_eq!(&got, b"ABBD");
        assert_eq!(image.read(AddrRange::new(BASE, 2)).unwrap(), vec![0, 0]);
    }

    #[test]
    fn out_of_bounds_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut image = PmImage::create(&dir.path().join("pm"), BASE, 64).unwrap();
        let below = image.write_store(AddrRange::new(BASE - 8, 8), &[0; 8]);
        assert!(matches!(below, Err(PmcheckError::ImageOutOfBounds { .. })));
        let past = image.write_store(AddrRange::new(BASE + 60, 8), &[0; 8]);
        assert!(matches!(
            past,
            Err(PmcheckError::ImageOutOfBounds { image_len: 64, .. })
        ));
    }

    #[test]
    fn copy_is_independent() {
        let dir = tempfile::tempdir().unwrap();
        let mut image = PmImage::create(&dir.path().join("pm"), BASE, 128).unwrap();
        image.write_store(AddrRange::new(BASE, 1), &[7]).unwrap();
        let mut copy = image.copy_to(&dir.path().join("pm-copy")).unwrap();
        copy.write_store(AddrRange::new(BASE, 1), &[9]).unwrap();
        assert_eq!(image.read(AddrRange::new(BASE, 1)).unwrap(), vec![7]);
        assert_eq!(copy.read(AddrRange::new(BASE, 1)).unwrap(), vec![9]);
        assert_eq!(copy.len(), 128);
    }
}
