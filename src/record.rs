//! Byte-exact codec for one cache record.
//!
//! Layout (all multi-byte integers big-endian):
//!
//! ```text
//! oid(8) status(1) tlen(4) vlen(2) dlen(4) serial(8) data(dlen)
//!   [ version(vlen) vdlen(4) vdata(vdlen) vserial(8) ]
//! tlen-trail(4)
//! ```
//!
//! The encoder only ever emits status `'v'`; transitions to `'n'`/`'i'` are
//! applied in place by [`crate::segment::Segment::invalidate`].

use std::io::{self, Read, Seek, SeekFrom};

/// Object identifier: opaque 8 bytes, compared bytewise.
pub type Oid = [u8; 8];

/// Revision serial: opaque 8 bytes, lexicographically ordered.
pub type Serial = [u8; 8];

/// The serial used when a record carries no non-version payload.
pub const ZERO_SERIAL: Serial = [0u8; 8];

/// Status byte for a record with a live non-version (and maybe version) payload.
pub const STATUS_VALID: u8 = b'v';
/// Status byte for a record whose version payload has been stripped.
pub const STATUS_NONVERSION: u8 = b'n';
/// Status byte for a dead record.
pub const STATUS_INVALID: u8 = b'i';

/// Length of the fixed header prefix: oid(8) + status(1) + tlen(4) + vlen(2) + dlen(4) + serial(8).
pub const HEADER_PREFIX_LEN: usize = 27;
/// Length of the trailing redundant `tlen` field.
pub const TLEN_TRAIL_LEN: usize = 4;
/// Smallest legal record: header prefix + trailing tlen, no data.
pub const MIN_RECORD_LEN: u32 = HEADER_PREFIX_LEN as u32 + TLEN_TRAIL_LEN as u32;

/// The 27-byte fixed prefix of a record, decoded and validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub oid: Oid,
    pub status: u8,
    pub tlen: u32,
    pub vlen: u16,
    pub dlen: u32,
    pub serial: Serial,
}

impl RecordHeader {
    /// Decodes and validates a 27-byte header prefix.
    ///
    /// Returns `None` for any structurally invalid header: unknown status
    /// byte, `tlen` too small to hold the prefix and trailer, or
    /// `vlen + dlen > tlen`.
    pub fn decode(buf: &[u8; HEADER_PREFIX_LEN]) -> Option<Self> {
        let status = buf[8];
        if status != STATUS_VALID && status != STATUS_NONVERSION && status != STATUS_INVALID {
            return None;
        }
        let tlen = u32::from_be_bytes(buf[9..13].try_into().unwrap());
        let vlen = u16::from_be_bytes(buf[13..15].try_into().unwrap());
        let dlen = u32::from_be_bytes(buf[15..19].try_into().unwrap());
        if tlen < MIN_RECORD_LEN || (vlen as u64) + (dlen as u64) > tlen as u64 {
            return None;
        }
        let oid: Oid = buf[0..8].try_into().unwrap();
        let serial: Serial = buf[19..27].try_into().unwrap();
        Some(Self {
            oid,
            status,
            tlen,
            vlen,
            dlen,
            serial,
        })
    }

    /// Whether this record currently holds a live entry (as opposed to
    /// having been invalidated).
    pub fn is_live(&self) -> bool {
        self.status == STATUS_VALID || self.status == STATUS_NONVERSION
    }
}

/// Reads and decodes a record header at `pos`, without consuming bytes past
/// the header prefix. Returns `Ok(None)` for a short/absent read (the
/// ordinary "nothing here" case during scanning), never an error for that.
pub fn read_header<R: Read + Seek>(r: &mut R, pos: u64) -> io::Result<Option<RecordHeader>> {
    r.seek(SeekFrom::Start(pos))?;
    let mut buf = [0u8; HEADER_PREFIX_LEN];
    match r.read_exact(&mut buf) {
        Ok(()) => Ok(RecordHeader::decode(&buf)),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e),
    }
}

/// Encodes one record.
///
/// - A missing `serial` forces `data` to empty and `serial` to all zeros
///   (the "placeholder carrying only version data" convention).
/// - `version` of `Some(&[])` is treated the same as `None`: no version
///   section is emitted.
#[allow(clippy::too_many_arguments)]
pub fn encode_record(
    oid: Oid,
    data: &[u8],
    serial: Option<Serial>,
    version: Option<&[u8]>,
    vdata: Option<&[u8]>,
    vserial: Option<Serial>,
) -> Vec<u8> {
    let (data, serial) = match serial {
        Some(s) => (data, s),
        None => (&[][..], ZERO_SERIAL),
    };

    let version = version.filter(|v| !v.is_empty());
    let vdata = vdata.unwrap_or(&[]);
    let vserial = vserial.unwrap_or(ZERO_SERIAL);

    let mut tlen = MIN_RECORD_LEN as usize + data.len();
    let vlen = if let Some(v) = version {
        tlen += v.len() + 12 + vdata.len();
        v.len() as u16
    } else {
        0u16
    };
    let tlen = tlen as u32;

    let mut out = Vec::with_capacity(tlen as usize);
    out.extend_from_slice(&oid);
    out.push(STATUS_VALID);
    out.extend_from_slice(&tlen.to_be_bytes());
    out.extend_from_slice(&vlen.to_be_bytes());
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(&serial);
    out.extend_from_slice(data);
    if let Some(v) = version {
        out.extend_from_slice(v);
        out.extend_from_slice(&(vdata.len() as u32).to_be_bytes());
        out.extend_from_slice(vdata);
        out.extend_from_slice(&vserial);
    }
    out.extend_from_slice(&tlen.to_be_bytes());
    out
}
