//! The cache controller: owns both segments, the index, and the single
//! mutex that serializes every public operation.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::Result;
use crate::paths;
use crate::record::{self, Oid, Serial, HEADER_PREFIX_LEN, STATUS_NONVERSION};
use crate::scanner;
use crate::segment::{Segment, FIRST_RECORD_POS};

/// Matches the original's own default total size budget.
pub const DEFAULT_TOTAL_SIZE_BYTES: u64 = 20_000_000;

/// Configuration for one [`Cache`] instance.
///
/// `client_tag` is the difference between persistent mode (both segments
/// are named files under the resolved var directory) and unnamed-temporary
/// mode (segments live in anonymous temp files and vanish with the
/// process).
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub storage_tag: String,
    pub total_size_bytes: u64,
    pub client_tag: Option<String>,
    pub var_dir: Option<PathBuf>,
}

impl CacheConfig {
    /// Starts a config for the given storage tag, with the original's
    /// default size budget and no client tag (unnamed-temporary mode).
    pub fn new(storage_tag: impl Into<String>) -> Self {
        Self {
            storage_tag: storage_tag.into(),
            total_size_bytes: DEFAULT_TOTAL_SIZE_BYTES,
            client_tag: None,
            var_dir: None,
        }
    }

    /// Switches to persistent mode, naming the segment files after `tag`.
    pub fn with_client_tag(mut self, tag: impl Into<String>) -> Self {
        self.client_tag = Some(tag.into());
        self
    }

    /// Overrides var-directory resolution outright.
    pub fn with_var_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.var_dir = Some(dir.into());
        self
    }

    /// Sets the total size budget; `limit` (the per-segment rotation
    /// threshold) is half of this.
    pub fn with_total_size_bytes(mut self, bytes: u64) -> Self {
        self.total_size_bytes = bytes;
        self
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::new(String::new())
    }
}

enum Mode {
    Persistent {
        var_dir: PathBuf,
        storage_tag: String,
        client_tag: String,
    },
    Temporary,
}

struct CacheInner {
    mode: Mode,
    segments: [Option<Segment>; 2],
    current: usize,
    append_pos: u64,
    limit: u64,
    index: HashMap<Oid, i64>,
    boot_entries: Vec<(Oid, (Serial, Option<Serial>))>,
}

/// A persistent (or unnamed-temporary), two-segment client-side object
/// cache. All operations acquire one internal mutex for their entire
/// duration; see the crate docs for the concurrency model.
pub struct Cache {
    inner: Mutex<CacheInner>,
}

impl Cache {
    /// Builds a cache from `config`. In persistent mode this opens or
    /// creates both segment files and runs the peek-serial bootstrap to
    /// decide which segment is current; it does not scan records. Call
    /// [`Cache::open`] for that.
    pub fn new(config: CacheConfig) -> Result<Self> {
        let limit = config.total_size_bytes / 2;

        let (mode, current_seg, alt_seg, current) = if let Some(client_tag) = config.client_tag.clone() {
            let var_dir = paths::resolve_var_dir(config.var_dir.as_deref());
            paths::ensure_var_dir(&var_dir)?;
            let path0 = paths::segment_path(&var_dir, &config.storage_tag, &client_tag, 0);
            let path1 = paths::segment_path(&var_dir, &config.storage_tag, &client_tag, 1);

            let mut seg0 = match Segment::open_persistent(&path0)? {
                Some(s) => s,
                None => Segment::create_persistent(&path0)?,
            };
            let mut seg1 = Segment::open_persistent(&path1)?;

            let peek0 = seg0.peek_serial()?;
            let peek1 = match seg1.as_mut() {
                Some(s) => s.peek_serial()?,
                None => record::ZERO_SERIAL,
            };

            let mode = Mode::Persistent {
                var_dir,
                storage_tag: config.storage_tag.clone(),
                client_tag,
            };

            if peek1 > peek0 {
                let current_seg = seg1.expect("peek1 > peek0 implies segment 1 is open");
                (mode, current_seg, Some(seg0), 1usize)
            } else if peek0 > peek1 {
                (mode, seg0, seg1, 0usize)
            } else {
                // Tie (including the all-zero fresh-cache case): default to
                // segment 0 and drop segment 1 from the working set, even
                // if its file happens to exist. It is reopened at the next
                // rotation if one is ever needed.
                (mode, seg0, None, 0usize)
            }
        } else {
            (Mode::Temporary, Segment::create_temp()?, None, 0usize)
        };

        let mut segments: [Option<Segment>; 2] = [None, None];
        segments[current] = Some(current_seg);
        segments[1 - current] = alt_seg;

        Ok(Self {
            inner: Mutex::new(CacheInner {
                mode,
                segments,
                current,
                append_pos: FIRST_RECORD_POS,
                limit,
                index: HashMap::new(),
                boot_entries: Vec::new(),
            }),
        })
    }

    /// Scans the alternate segment then the current segment, rebuilding the
    /// index and the append position, and returns the (oid, (serial,
    /// vserial)) pairs the caller should replay through its invalidation
    /// handshake. Intended to be called exactly once, right after
    /// construction, before any other operation.
    pub fn open(&self) -> Result<Vec<(Oid, (Serial, Option<Serial>))>> {
        self.inner.lock().unwrap().open()
    }

    /// Closes both segment handles. Close failures are not surfaced, matching
    /// the original implementation's best-effort cleanup posture; in Rust
    /// this happens for free since `File`'s `Drop` impl never panics or
    /// reports errors.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.segments = [None, None];
    }

    /// Calls `f(oid, serial, vserial)` for every pair [`Cache::open`]
    /// returned, replaying the same bootstrap sequence for the caller's
    /// server-invalidation handshake.
    pub fn verify<F: FnMut(Oid, Serial, Option<Serial>)>(&self, mut f: F) {
        let inner = self.inner.lock().unwrap();
        for (oid, (serial, vserial)) in inner.boot_entries.iter().copied() {
            f(oid, serial, vserial);
        }
    }

    /// Looks up `oid`, optionally within `version` (empty means the
    /// non-version trunk). Returns `None` on a cache miss, a stale index
    /// entry, or an empty non-version payload with no matching version.
    pub fn load(&self, oid: Oid, version: &[u8]) -> Result<Option<(Vec<u8>, Serial)>> {
        self.inner.lock().unwrap().load(oid, version)
    }

    /// Appends a new record for `oid` at the current append position. Does
    /// not check or enforce the size limit; call [`Cache::check_size`] first
    /// with the size you are about to write.
    #[allow(clippy::too_many_arguments)]
    pub fn store(
        &self,
        oid: Oid,
        data: &[u8],
        serial: Option<Serial>,
        version: Option<&[u8]>,
        vdata: Option<&[u8]>,
        vserial: Option<Serial>,
    ) -> Result<()> {
        self.inner.lock().unwrap().store(oid, data, serial, version, vdata, vserial)
    }

    /// Writes a new versioned revision, preserving the existing non-version
    /// half (if any) under it. With an empty `version` this is equivalent
    /// to [`Cache::store`] with only a non-version payload.
    pub fn update(&self, oid: Oid, serial: Serial, version: &[u8], data: &[u8]) -> Result<()> {
        self.inner.lock().unwrap().update(oid, serial, version, data)
    }

    /// Drops (`version` empty) or demotes (`version` non-empty, strips the
    /// version payload but keeps the non-version half) the record for
    /// `oid`. A no-op if `oid` is absent or its index entry is stale.
    pub fn invalidate(&self, oid: Oid, version: &[u8]) -> Result<()> {
        self.inner.lock().unwrap().invalidate(oid, version)
    }

    /// Returns the version name the cached record for `oid` carries:
    /// `Some(name)` (name may be empty, meaning non-version), or `None` for
    /// a miss, a stale entry, or a record already demoted to `'n'`.
    pub fn modified_in_version(&self, oid: Oid) -> Result<Option<Vec<u8>>> {
        self.inner.lock().unwrap().modified_in_version(oid)
    }

    /// If the active segment's append position plus `anticipated_bytes`
    /// would exceed the configured limit, rotates: the current segment
    /// becomes the alternate, and the other slot is reset to a fresh,
    /// empty segment which becomes current.
    pub fn check_size(&self, anticipated_bytes: u64) -> Result<()> {
        self.inner.lock().unwrap().check_size(anticipated_bytes)
    }
}

impl CacheInner {
    fn open(&mut self) -> Result<Vec<(Oid, (Serial, Option<Serial>))>> {
        let alt = 1 - self.current;
        let mut index = HashMap::new();
        let mut serials = HashMap::new();

        if let Some(seg) = self.segments[alt].as_mut() {
            scanner::scan(seg, alt == 1, &mut index, &mut serials)?;
        }
        let cur_seg = self.segments[self.current]
            .as_mut()
            .expect("current segment is always present after construction");
        let append_pos = scanner::scan(cur_seg, self.current == 1, &mut index, &mut serials)?;

        self.index = index;
        self.append_pos = append_pos;
        let entries: Vec<_> = serials.into_iter().collect();
        self.boot_entries = entries.clone();

        tracing::info!(
            active_segment = self.current,
            entries = self.boot_entries.len(),
            append_pos = self.append_pos,
            "object cache opened"
        );

        Ok(entries)
    }

    fn load(&mut self, oid: Oid, version: &[u8]) -> Result<Option<(Vec<u8>, Serial)>> {
        let Some(&signed) = self.index.get(&oid) else {
            return Ok(None);
        };
        let (seg_idx, pos) = unsign(signed);
        let seg = self.segments[seg_idx]
            .as_mut()
            .expect("index entry points at a live segment slot");
        let file = seg.file_mut();

        let header = match record::read_header(file, pos)? {
            Some(h) if h.oid == oid => h,
            _ => {
                self.index.remove(&oid);
                return Ok(None);
            }
        };

        if header.status == STATUS_NONVERSION {
            if !version.is_empty() {
                return Ok(None);
            }
            return if header.dlen > 0 {
                Ok(Some((read_data(file, pos, header.dlen)?, header.serial)))
            } else {
                self.index.remove(&oid);
                Ok(None)
            };
        }

        if version.is_empty() || header.vlen == 0 {
            return if header.dlen > 0 {
                Ok(Some((read_data(file, pos, header.dlen)?, header.serial)))
            } else {
                Ok(None)
            };
        }

        let name = read_version_name(file, pos, header.dlen, header.vlen)?;
        if name == version {
            let (vdata, vserial) = read_vdata_and_vserial(file, pos, header.dlen, header.vlen)?;
            Ok(Some((vdata, vserial)))
        } else if header.dlen > 0 {
            Ok(Some((read_data(file, pos, header.dlen)?, header.serial)))
        } else {
            Ok(None)
        }
    }

    fn append_encoded(&mut self, oid: Oid, bytes: Vec<u8>) -> Result<()> {
        let seg = self.segments[self.current]
            .as_mut()
            .expect("current segment is always present after construction");
        seg.append(self.append_pos, &bytes)?;
        self.index.insert(oid, sign(self.append_pos, self.current));
        self.append_pos += bytes.len() as u64;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn store(
        &mut self,
        oid: Oid,
        data: &[u8],
        serial: Option<Serial>,
        version: Option<&[u8]>,
        vdata: Option<&[u8]>,
        vserial: Option<Serial>,
    ) -> Result<()> {
        let bytes = record::encode_record(oid, data, serial, version, vdata, vserial);
        self.append_encoded(oid, bytes)
    }

    fn update(&mut self, oid: Oid, serial: Serial, version: &[u8], data: &[u8]) -> Result<()> {
        if version.is_empty() {
            return self.store(oid, data, Some(serial), None, None, None);
        }

        let bytes = match self.load(oid, &[])? {
            Some((existing_data, existing_serial)) if !existing_data.is_empty() => record::encode_record(
                oid,
                &existing_data,
                Some(existing_serial),
                Some(version),
                Some(data),
                Some(serial),
            ),
            _ => record::encode_record(oid, &[], None, Some(version), Some(data), Some(serial)),
        };
        self.append_encoded(oid, bytes)
    }

    fn invalidate(&mut self, oid: Oid, version: &[u8]) -> Result<()> {
        let Some(&signed) = self.index.get(&oid) else {
            return Ok(());
        };
        let (seg_idx, pos) = unsign(signed);
        let seg = self.segments[seg_idx]
            .as_mut()
            .expect("index entry points at a live segment slot");
        let header = record::read_header(seg.file_mut(), pos)?;
        match header {
            Some(h) if h.oid == oid => {
                if version.is_empty() {
                    seg.invalidate(pos, false)?;
                    self.index.remove(&oid);
                } else {
                    seg.invalidate(pos, true)?;
                }
                Ok(())
            }
            _ => {
                self.index.remove(&oid);
                Ok(())
            }
        }
    }

    fn modified_in_version(&mut self, oid: Oid) -> Result<Option<Vec<u8>>> {
        let Some(&signed) = self.index.get(&oid) else {
            return Ok(None);
        };
        let (seg_idx, pos) = unsign(signed);
        let seg = self.segments[seg_idx]
            .as_mut()
            .expect("index entry points at a live segment slot");
        let file = seg.file_mut();

        let header = match record::read_header(file, pos)? {
            Some(h) if h.oid == oid => h,
            _ => {
                self.index.remove(&oid);
                return Ok(None);
            }
        };

        if header.status == STATUS_NONVERSION {
            return Ok(None);
        }
        if header.vlen == 0 {
            return Ok(Some(Vec::new()));
        }
        Ok(Some(read_version_name(file, pos, header.dlen, header.vlen)?))
    }

    fn check_size(&mut self, anticipated_bytes: u64) -> Result<()> {
        if self.append_pos + anticipated_bytes <= self.limit {
            return Ok(());
        }
        let new_current = 1 - self.current;
        let fresh = match &self.mode {
            Mode::Persistent {
                var_dir,
                storage_tag,
                client_tag,
            } => {
                let path = paths::segment_path(var_dir, storage_tag, client_tag, new_current as u8);
                Segment::create_persistent(&path)?
            }
            Mode::Temporary => Segment::create_temp()?,
        };
        self.segments[new_current] = Some(fresh);
        self.current = new_current;
        self.append_pos = FIRST_RECORD_POS;
        tracing::debug!(new_active = self.current, "object cache rotated segments");
        Ok(())
    }
}

fn sign(pos: u64, segment_idx: usize) -> i64 {
    if segment_idx == 0 {
        pos as i64
    } else {
        -(pos as i64)
    }
}

fn unsign(signed: i64) -> (usize, u64) {
    if signed >= 0 {
        (0, signed as u64)
    } else {
        (1, (-signed) as u64)
    }
}

fn read_data(file: &mut File, pos: u64, dlen: u32) -> io::Result<Vec<u8>> {
    file.seek(SeekFrom::Start(pos + HEADER_PREFIX_LEN as u64))?;
    let mut buf = vec![0u8; dlen as usize];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_version_name(file: &mut File, pos: u64, dlen: u32, vlen: u16) -> io::Result<Vec<u8>> {
    file.seek(SeekFrom::Start(pos + HEADER_PREFIX_LEN as u64 + dlen as u64))?;
    let mut buf = vec![0u8; vlen as usize];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_vdata_and_vserial(file: &mut File, pos: u64, dlen: u32, vlen: u16) -> io::Result<(Vec<u8>, Serial)> {
    let vdlen_pos = pos + HEADER_PREFIX_LEN as u64 + dlen as u64 + vlen as u64;
    file.seek(SeekFrom::Start(vdlen_pos))?;
    let mut vdlen_buf = [0u8; 4];
    file.read_exact(&mut vdlen_buf)?;
    let vdlen = u32::from_be_bytes(vdlen_buf);
    let mut vdata = vec![0u8; vdlen as usize];
    file.read_exact(&mut vdata)?;
    let mut vserial = [0u8; 8];
    file.read_exact(&mut vserial)?;
    Ok((vdata, vserial))
}

#[cfg(test)]
impl Cache {
    /// Raw (segment, offset) the index currently holds for `oid`, for tests
    /// that need to keep reading a record's bytes after an operation (like
    /// `invalidate`) has dropped it from the index.
    fn raw_location(&self, oid: Oid) -> Option<(usize, u64)> {
        let inner = self.inner.lock().unwrap();
        inner.index.get(&oid).copied().map(unsign)
    }

    /// Reads the on-disk status byte of the record at `(seg_idx, pos)`.
    fn raw_status_byte(&self, seg_idx: usize, pos: u64) -> u8 {
        let mut inner = self.inner.lock().unwrap();
        let seg = inner.segments[seg_idx].as_mut().unwrap();
        let file = seg.file_mut();
        file.seek(SeekFrom::Start(pos + 8)).unwrap();
        let mut status = [0u8; 1];
        file.read_exact(&mut status).unwrap();
        status[0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oid(n: u8) -> Oid {
        [0, 0, 0, 0, 0, 0, 0, n]
    }
    fn serial(n: u8) -> Serial {
        [0, 0, 0, 0, 0, 0, 0, n]
    }

    fn temp_cache(total_size_bytes: u64) -> Cache {
        Cache::new(CacheConfig::new("s").with_total_size_bytes(total_size_bytes)).unwrap()
    }

    #[test]
    fn s1_store_and_load_plain() {
        let cache = temp_cache(10_000);
        cache.open().unwrap();
        cache.store(oid(1), b"abc", Some(serial(11)), None, None, None).unwrap();

        let (data, s) = cache.load(oid(1), b"").unwrap().unwrap();
        assert_eq!(data, b"abc");
        assert_eq!(s, serial(11));
        assert_eq!(cache.modified_in_version(oid(1)).unwrap(), Some(Vec::new()));
    }

    #[test]
    fn s2_store_and_load_versioned() {
        let cache = temp_cache(10_000);
        cache.open().unwrap();
        cache
            .store(oid(1), b"abc", Some(serial(11)), Some(b"v1"), Some(b"ABC"), Some(serial(21)))
            .unwrap();

        assert_eq!(cache.load(oid(1), b"").unwrap().unwrap(), (b"abc".to_vec(), serial(11)));
        assert_eq!(cache.load(oid(1), b"v1").unwrap().unwrap(), (b"ABC".to_vec(), serial(21)));
        assert_eq!(cache.load(oid(1), b"v2").unwrap().unwrap(), (b"abc".to_vec(), serial(11)));
        assert_eq!(cache.modified_in_version(oid(1)).unwrap(), Some(b"v1".to_vec()));
    }

    #[test]
    fn s3_invalidate_non_version() {
        let cache = temp_cache(10_000);
        cache.open().unwrap();
        cache
            .store(oid(1), b"abc", Some(serial(11)), Some(b"v1"), Some(b"ABC"), Some(serial(21)))
            .unwrap();
        let (seg_idx, pos) = cache.raw_location(oid(1)).unwrap();
        cache.invalidate(oid(1), b"").unwrap();

        assert!(cache.load(oid(1), b"").unwrap().is_none());
        assert!(cache.load(oid(1), b"v1").unwrap().is_none());
        assert_eq!(cache.raw_status_byte(seg_idx, pos), record::STATUS_INVALID);
    }

    #[test]
    fn s4_invalidate_version_only() {
        let cache = temp_cache(10_000);
        cache.open().unwrap();
        cache
            .store(oid(1), b"abc", Some(serial(11)), Some(b"v1"), Some(b"ABC"), Some(serial(21)))
            .unwrap();
        cache.invalidate(oid(1), b"v1").unwrap();
        let (seg_idx, pos) = cache.raw_location(oid(1)).unwrap();

        assert!(cache.load(oid(1), b"v1").unwrap().is_none());
        assert_eq!(cache.load(oid(1), b"").unwrap().unwrap(), (b"abc".to_vec(), serial(11)));
        assert!(cache.modified_in_version(oid(1)).unwrap().is_none());
        assert_eq!(cache.raw_status_byte(seg_idx, pos), record::STATUS_NONVERSION);
    }

    #[test]
    fn update_preserves_existing_nonversion_half() {
        let cache = temp_cache(10_000);
        cache.open().unwrap();
        cache.store(oid(1), b"abc", Some(serial(11)), None, None, None).unwrap();
        cache.update(oid(1), serial(21), b"v1", b"ABC").unwrap();

        assert_eq!(cache.load(oid(1), b"v1").unwrap().unwrap(), (b"ABC".to_vec(), serial(21)));
        assert_eq!(cache.load(oid(1), b"").unwrap().unwrap(), (b"abc".to_vec(), serial(11)));
    }

    #[test]
    fn update_with_empty_version_is_plain_store() {
        let cache = temp_cache(10_000);
        cache.open().unwrap();
        cache.update(oid(1), serial(5), b"", b"hello").unwrap();
        assert_eq!(cache.load(oid(1), b"").unwrap().unwrap(), (b"hello".to_vec(), serial(5)));
    }

    #[test]
    fn check_size_rotates_when_limit_exceeded() {
        let cache = temp_cache(200);
        cache.open().unwrap();
        for i in 0..20u8 {
            let bytes = record::encode_record(oid(i), b"0123456789", Some(serial(i)), None, None, None);
            cache.check_size(bytes.len() as u64).unwrap();
            cache.store(oid(i), b"0123456789", Some(serial(i)), None, None, None).unwrap();
        }
        // Some early oids must have rotated out of the working index while
        // later ones remain loadable.
        assert!(cache.load(oid(19), b"").unwrap().is_some());
    }

    #[test]
    fn verify_replays_exactly_the_entries_open_returned() {
        let cache = temp_cache(10_000);
        cache.open().unwrap();
        cache.store(oid(1), b"abc", Some(serial(11)), None, None, None).unwrap();
        cache.close();

        let cache2 = temp_cache(10_000);
        // Unnamed temporaries don't persist; this just checks verify()
        // replays whatever open() returned, even if that is empty.
        let opened = cache2.open().unwrap();
        let mut seen = Vec::new();
        cache2.verify(|oid, serial, vserial| seen.push((oid, (serial, vserial))));
        assert_eq!(opened, seen);
    }
}
