//! LSN parsing and WAL segment name arithmetic.

use crate::{BackupError, Result, WAL_SEGMENT_SIZE};

/// Segments per 4 GiB of WAL at the fixed segment size.
const SEGMENTS_PER_XLOG_ID: u64 = 0x1_0000_0000 / WAL_SEGMENT_SIZE;

/// Parses a textual LSN of the form `X/Y` into its 64-bit value.
pub fn parse_lsn(text: &str) -> Result<u64> {
    let (hi, lo) = text
        .split_once('/')
        .ok_or_else(|| BackupError::Archive(format!("malformed LSN '{text}'")))?;
    let hi = u64::from_str_radix(hi, 16)
        .map_err(|_| BackupError::Archive(format!("malformed LSN '{text}'")))?;
    let lo = u64::from_str_radix(lo, 16)
        .map_err(|_| BackupError::Archive(format!("malformed LSN '{text}'")))?;
    Ok((hi << 32) | lo)
}

/// Formats the 24-hex-character WAL segment name holding `lsn`.
pub fn wal_segment_name(timeline: u32, lsn: u64) -> String {
    let seg_no = lsn / WAL_SEGMENT_SIZE;
    format!(
        "{:08X}{:08X}{:08X}",
        timeline,
        seg_no / SEGMENTS_PER_XLOG_ID,
        seg_no % SEGMENTS_PER_XLOG_ID
    )
}

/// Parses a 24-hex-character segment name into (timeline, segment number).
pub fn parse_wal_segment_name(name: &str) -> Result<(u32, u64)> {
    if name.len() != 24 || !name.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(BackupError::Archive(format!(
            "malformed WAL segment name '{name}'"
        )));
    }
    let timeline = u32::from_str_radix(&name[0..8], 16)
        .map_err(|_| BackupError::Archive(format!("malformed WAL segment name '{name}'")))?;
    let log = u64::from_str_radix(&name[8..16], 16)
        .map_err(|_| BackupError::Archive(format!("malformed WAL segment name '{name}'")))?;
    let seg = u64::from_str_radix(&name[16..24], 16)
        .map_err(|_| BackupError::Archive(format!("malformed WAL segment name '{name}'")))?;
    Ok((timeline, log * SEGMENTS_PER_XLOG_ID + seg))
}

/// Names of the `count` segments following `name` on the same timeline.
pub fn following_segments(name: &str, count: usize) -> Result<Vec<String>> {
    let (timeline, seg_no) = parse_wal_segment_name(name)?;
    Ok((1..=count as u64)
        .map(|i| {
            let n = seg_no + i;
            format!(
                "{:08X}{:08X}{:08X}",
                timeline,
                n / SEGMENTS_PER_XLOG_ID,
                n % SEGMENTS_PER_XLOG_ID
            )
        })
        .collect())
}

/// Extracts the timeline from a segment name.
pub fn segment_timeline(name: &str) -> Result<u32> {
    Ok(parse_wal_segment_name(name)?.0)
}
