//! Rebuilds the in-memory index and serial map from one segment file.
//!
//! Runs once per segment at cache open, and again in the restart-recovery
//! tests to check idempotence. Stops at the first short or malformed
//! record and truncates the file there; this is the crate's only
//! crash-recovery mechanism, and it never returns an error for ordinary
//! truncated-tail corruption.

use std::collections::HashMap;
use std::io::{self, Read, Seek, SeekFrom};

use crate::record::{
    Oid, RecordHeader, Serial, HEADER_PREFIX_LEN, STATUS_INVALID, STATUS_NONVERSION, STATUS_VALID,
};
use crate::segment::{Segment, FIRST_RECORD_POS};

/// Scans `segment` from its first record forward, folding live entries into
/// `index`/`serials` and applying invalidations, then truncates the file at
/// the first bad record (or at EOF, a no-op). `is_second_segment` selects
/// the sign convention used when recording offsets in `index`.
///
/// Returns the new append position for this segment: the offset one past
/// the last good record.
pub fn scan(
    segment: &mut Segment,
    is_second_segment: bool,
    index: &mut HashMap<Oid, i64>,
    serials: &mut HashMap<Oid, (Serial, Option<Serial>)>,
) -> io::Result<u64> {
    let file = segment.file_mut();
    let mut pos = FIRST_RECORD_POS;

    loop {
        if file.seek(SeekFrom::Start(pos)).is_err() {
            break;
        }
        let mut header_buf = [0u8; HEADER_PREFIX_LEN];
        if file.read_exact(&mut header_buf).is_err() {
            break;
        }
        let header = match RecordHeader::decode(&header_buf) {
            Some(h) => h,
            None => break,
        };

        let mut vserial: Option<Serial> = None;
        if header.status == STATUS_VALID && header.vlen > 0 {
            let skip = header.dlen as i64 + header.vlen as i64;
            if file.seek(SeekFrom::Current(skip)).is_err() {
                break;
            }
            let mut vdlen_buf = [0u8; 4];
            if file.read_exact(&mut vdlen_buf).is_err() {
                break;
            }
            let vdlen = u32::from_be_bytes(vdlen_buf);
            let needed = header.dlen as u64 + header.vlen as u64 + 42 + vdlen as u64;
            if needed > header.tlen as u64 {
                break;
            }
            if file.seek(SeekFrom::Current(vdlen as i64)).is_err() {
                break;
            }
            let mut vserial_buf = [0u8; 8];
            if file.read_exact(&mut vserial_buf).is_err() {
                break;
            }
            let mut trail = [0u8; 4];
            if file.read_exact(&mut trail).is_err() {
                break;
            }
            // Preserved as-specified: this checks the trailing 4 bytes
            // against the first 4 bytes of the header (half of oid), not
            // against tlen.
            if trail != header_buf[0..4] {
                break;
            }
            vserial = Some(vserial_buf);
        }

        match header.status {
            STATUS_VALID | STATUS_NONVERSION => {
                let signed = if is_second_segment { -(pos as i64) } else { pos as i64 };
                index.insert(header.oid, signed);
                serials.insert(header.oid, (header.serial, vserial));
            }
            STATUS_INVALID => {
                index.remove(&header.oid);
                serials.remove(&header.oid);
            }
            _ => unreachable!("RecordHeader::decode only accepts known status bytes"),
        }

        pos += header.tlen as u64;
    }

    let _ = segment.truncate(pos);
    Ok(pos)
}
