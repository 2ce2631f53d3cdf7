//! One append-only segment file: a 4-byte magic header followed by a run
//! of records. No mmap: every access is an explicit seek plus
//! `read_exact`/`write_all`, since records are read and written at scattered
//! offsets rather than streamed sequentially.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{CacheError, Result};
use crate::record::Serial;

/// 4-byte magic that opens every segment file.
pub const MAGIC: &[u8; 4] = b"ZEC0";
/// Byte offset of the first legal record.
pub const FIRST_RECORD_POS: u64 = MAGIC.len() as u64;
/// Offset of the `serial` field within the first record's header, used for
/// the bootstrap peek read.
const PEEK_SERIAL_OFFSET: u64 = 22;

/// An append-only segment file, persistent or unnamed-temporary.
pub struct Segment {
    file: File,
    path: Option<PathBuf>,
}

impl Segment {
    /// Creates a brand-new persistent segment at `path`, overwriting
    /// whatever was there. Writes the magic header; the caller's append
    /// position starts at [`FIRST_RECORD_POS`].
    pub fn create_persistent(path: &Path) -> Result<Self> {
        if let Err(e) = fs::remove_file(path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove old segment file, truncating instead");
            }
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| CacheError::io(e, path))?;
        file.write_all(MAGIC).map_err(|e| CacheError::io(e, path))?;
        Ok(Self {
            file,
            path: Some(path.to_path_buf()),
        })
    }

    /// Creates a brand-new unnamed temporary segment: no path survives it
    /// past process exit, matching the original's "unnamed temporary file"
    /// fallback mode.
    pub fn create_temp() -> Result<Self> {
        let mut file = tempfile::tempfile()?;
        file.write_all(MAGIC)?;
        Ok(Self { file, path: None })
    }

    /// Opens an existing persistent segment, if `path` exists. Returns
    /// `Ok(None)` when there is nothing there yet (the caller should fall
    /// back to [`Segment::create_persistent`]).
    pub fn open_persistent(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| CacheError::io(e, path))?;
        let mut magic = [0u8; 4];
        file.seek(SeekFrom::Start(0)).map_err(|e| CacheError::io(e, path))?;
        let magic_ok = file.read_exact(&mut magic).is_ok() && &magic == MAGIC;
        if !magic_ok {
            return Err(CacheError::InvalidSegmentHeader {
                path: path.to_path_buf(),
            });
        }
        Ok(Some(Self {
            file,
            path: Some(path.to_path_buf()),
        }))
    }

    /// Path on disk, if this is a persistent segment.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Current length of the underlying file.
    pub fn file_len(&mut self) -> Result<u64> {
        let path = self.path.clone();
        self.file
            .seek(SeekFrom::End(0))
            .map_err(|e| self.wrap(e, path.as_deref()))
    }

    /// Reads the bootstrap "peek serial": the 8-byte serial of the first
    /// record, if the file is long enough to carry one. Returns the zero
    /// serial for an empty or too-short segment.
    pub fn peek_serial(&mut self) -> Result<Serial> {
        let len = self.file_len()?;
        if len <= 30 {
            return Ok(crate::record::ZERO_SERIAL);
        }
        let path = self.path.clone();
        self.file
            .seek(SeekFrom::Start(PEEK_SERIAL_OFFSET))
            .map_err(|e| self.wrap(e, path.as_deref()))?;
        let mut buf = [0u8; 8];
        self.file
            .read_exact(&mut buf)
            .map_err(|e| self.wrap(e, path.as_deref()))?;
        Ok(buf)
    }

    /// Appends already-encoded record bytes at `pos`, the caller's current
    /// append position.
    pub fn append(&mut self, pos: u64, bytes: &[u8]) -> Result<()> {
        let path = self.path.clone();
        self.file.seek(SeekFrom::Start(pos)).map_err(|e| self.wrap(e, path.as_deref()))?;
        self.file.write_all(bytes).map_err(|e| self.wrap(e, path.as_deref()))
    }

    /// Rewrites the status byte of the record at `pos` in place: `'n'` if
    /// `versioned` is true (demote, strip version payload logically), else
    /// `'i'` (kill the record outright).
    pub fn invalidate(&mut self, pos: u64, versioned: bool) -> Result<()> {
        let status = if versioned {
            crate::record::STATUS_NONVERSION
        } else {
            crate::record::STATUS_INVALID
        };
        let path = self.path.clone();
        self.file
            .seek(SeekFrom::Start(pos + 8))
            .map_err(|e| self.wrap(e, path.as_deref()))?;
        self.file.write_all(&[status]).map_err(|e| self.wrap(e, path.as_deref()))
    }

    /// Truncates the file at `pos`, discarding anything past it. Used by
    /// the scanner to drop a malformed or truncated tail; failures are
    /// tolerated by the caller on read-only media.
    pub fn truncate(&mut self, pos: u64) -> io::Result<()> {
        self.file.set_len(pos)
    }

    /// Direct access to the underlying file for header/payload reads, kept
    /// generic over `Read + Seek` in the scanner and controller.
    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    fn wrap(&self, source: io::Error, path: Option<&Path>) -> CacheError {
        match path {
            Some(p) => CacheError::io(source, p),
            None => CacheError::from(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read as _;

    #[test]
    fn create_persistent_writes_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg0.zec");
        let mut seg = Segment::create_persistent(&path).unwrap();
        assert_eq!(seg.file_len().unwrap(), 4);
        let mut buf = Vec::new();
        seg.file_mut().seek(SeekFrom::Start(0)).unwrap();
        seg.file_mut().read_to_end(&mut buf).unwrap();
        assert_eq!(&buf, MAGIC);
    }

    #[test]
    fn open_persistent_rejects_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg0.zec");
        fs::write(&path, b"NOPE").unwrap();
        let err = Segment::open_persistent(&path).unwrap_err();
        assert!(matches!(err, CacheError::InvalidSegmentHeader { .. }));
    }

    #[test]
    fn open_persistent_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.zec");
        assert!(Segment::open_persistent(&path).unwrap().is_none());
    }

    #[test]
    fn peek_serial_zero_for_short_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg0.zec");
        let mut seg = Segment::create_persistent(&path).unwrap();
        assert_eq!(seg.peek_serial().unwrap(), crate::record::ZERO_SERIAL);
    }

    #[test]
    fn append_and_invalidate_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg0.zec");
        let mut seg = Segment::create_persistent(&path).unwrap();
        let record = crate::record::encode_record(
            [0, 0, 0, 0, 0, 0, 0, 1],
            b"abc",
            Some([0, 0, 0, 0, 0, 0, 0, 11]),
            None,
            None,
            None,
        );
        seg.append(FIRST_RECORD_POS, &record).unwrap();
        seg.invalidate(FIRST_RECORD_POS, false).unwrap();
        seg.file_mut().seek(SeekFrom::Start(FIRST_RECORD_POS + 8)).unwrap();
        let mut status = [0u8; 1];
        seg.file_mut().read_exact(&mut status).unwrap();
        assert_eq!(status[0], crate::record::STATUS_INVALID);
    }

    #[test]
    fn create_temp_has_no_path() {
        let seg = Segment::create_temp().unwrap();
        assert!(seg.path().is_none());
    }
}
