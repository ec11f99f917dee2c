//! engine/log — commit log file format (QNLOG001).
//!
//! Layout:
//! - file header, 16 bytes: MAGIC "QNLOG001" + reserved u64 (LE, zero)
//! - frames, one per commit:
//!   [0..4)  payload length (u32 LE)
//!   [4..8)  CRC32 of the payload (u32 LE)
//!   [8..)   payload: JSON-encoded CommitRecord
//!
//! Reading is tolerant to a partial tail (a writer crashed mid-append, or another
//! process is appending right now): read_next_frame returns Ok(None). A CRC
//! mismatch on a complete frame is an integrity error.

use anyhow::{anyhow, bail, Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use super::ops::CommitRecord;

pub const LOG_MAGIC: &[u8; 8] = b"QNLOG001";
pub const LOG_HDR_SIZE: usize = 16;
pub const FRAME_HDR_SIZE: usize = 8;

/// Upper bound for a single commit payload; larger lengths mean a torn/corrupt header.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

pub fn write_log_header(f: &mut File) -> Result<()> {
    let mut hdr = [0u8; LOG_HDR_SIZE];
    hdr[..8].copy_from_slice(LOG_MAGIC);
    f.seek(SeekFrom::Start(0))?;
    f.write_all(&hdr)?;
    Ok(())
}

/// Check the file header. Err on short file or wrong magic.
pub fn check_log_header(f: &mut File) -> Result<()> {
    if f.metadata()?.len() < LOG_HDR_SIZE as u64 {
        bail!("commit log too small (< header)");
    }
    let mut hdr = [0u8; LOG_HDR_SIZE];
    f.seek(SeekFrom::Start(0))?;
    f.read_exact(&mut hdr)?;
    if &hdr[..8] != LOG_MAGIC {
        bail!("bad commit log magic");
    }
    Ok(())
}

pub fn encode_frame(record: &CommitRecord) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(record).context("encode commit record")?;
    if payload.len() as u64 > MAX_FRAME_LEN as u64 {
        bail!("commit record too large: {} bytes", payload.len());
    }
    let mut out = vec![0u8; FRAME_HDR_SIZE + payload.len()];
    LittleEndian::write_u32(&mut out[0..4], payload.len() as u32);
    LittleEndian::write_u32(&mut out[4..8], crc32fast::hash(&payload));
    out[FRAME_HDR_SIZE..].copy_from_slice(&payload);
    Ok(out)
}

/// Read the frame starting at `pos`. `file_len` is the current file length.
///
/// Returns:
/// - Ok(Some((record, next_pos))) — complete and valid frame;
/// - Ok(None) — EOF or partial tail;
/// - Err — CRC mismatch, undecodable payload or I/O error.
pub fn read_next_frame(f: &mut File, pos: u64, file_len: u64) -> Result<Option<(CommitRecord, u64)>> {
    if pos + FRAME_HDR_SIZE as u64 > file_len {
        return Ok(None);
    }
    let mut hdr = [0u8; FRAME_HDR_SIZE];
    f.seek(SeekFrom::Start(pos))?;
    f.read_exact(&mut hdr)?;
    let len = LittleEndian::read_u32(&hdr[0..4]);
    let crc = LittleEndian::read_u32(&hdr[4..8]);
    if len > MAX_FRAME_LEN {
        return Err(anyhow!("frame at {} claims {} bytes", pos, len));
    }
    let end = pos + FRAME_HDR_SIZE as u64 + len as u64;
    if end > file_len {
        return Ok(None);
    }
    let mut payload = vec![0u8; len as usize];
    f.read_exact(&mut payload)?;
    let actual = crc32fast::hash(&payload);
    if actual != crc {
        bail!(
            "commit log CRC mismatch at {}: stored {:08x}, computed {:08x}",
            pos,
            crc,
            actual
        );
    }
    let record: CommitRecord = serde_json::from_slice(&payload)
        .with_context(|| format!("decode commit record at {}", pos))?;
    Ok(Some((record, end)))
}
