//! The `.dso`/snapshot container framing (spec sections 4.5, 6.3, component F).
//!
//! Every persisted unit — a compiled [`CodeBlock`] or a
//! [`crate::serialize`] snapshot — is wrapped in the same block framing: a
//! 4-byte ASCII magic, a 32-bit little-endian size, the payload, then zero or
//! one pad byte so the next block starts 2-byte aligned (spec section 6.3).
//! This module owns only that outer framing; the payload bytes themselves are
//! `postcard`-encoded, since the teacher's own persisted types (`CodeBlock`
//! here) already derive `serde::{Serialize, Deserialize}` for exactly this.

use crate::codeblock::CodeBlock;
use crate::error::RuntimeFault;

pub const MAGIC_CSOB: [u8; 4] = *b"CSOB";
pub const MAGIC_DSOB: [u8; 4] = *b"DSOB";
pub const MAGIC_EOLB: [u8; 4] = *b"EOLB";

const DSO_VERSION: u32 = 1;

/// Writes one framed block: magic, size, payload, alignment pad.
fn write_block(out: &mut Vec<u8>, magic: [u8; 4], payload: &[u8]) {
    out.extend_from_slice(&magic);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    if payload.len() % 2 != 0 {
        out.push(0);
    }
}

/// Reads one framed block starting at `pos`, returning `(magic, payload, next_pos)`.
fn read_block(bytes: &[u8], pos: usize) -> Result<([u8; 4], &[u8], usize), RuntimeFault> {
    let header = bytes
        .get(pos..pos + 8)
        .ok_or_else(|| RuntimeFault::BadCodeblock("truncated block header".into()))?;
    let mut magic = [0u8; 4];
    magic.copy_from_slice(&header[0..4]);
    let size = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
    let payload_start = pos + 8;
    let payload = bytes
        .get(payload_start..payload_start + size)
        .ok_or_else(|| RuntimeFault::BadCodeblock("truncated block payload".into()))?;
    let mut next = payload_start + size;
    if size % 2 != 0 {
        next += 1;
    }
    Ok((magic, payload, next))
}

fn postcard_fault(err: postcard::Error) -> RuntimeFault {
    RuntimeFault::BadCodeblock(format!("malformed bytecode container: {err}"))
}

/// Serializes `codeblock` as a versioned `CSOB` container holding one
/// `DSOB` block, terminated by an empty `EOLB` marker (spec section 4.5).
pub fn save_dso(codeblock: &CodeBlock) -> Result<Vec<u8>, RuntimeFault> {
    let dsob_payload = postcard::to_allocvec(codeblock).map_err(postcard_fault)?;
    let mut inner = Vec::new();
    write_block(&mut inner, MAGIC_DSOB, &dsob_payload);
    write_block(&mut inner, MAGIC_EOLB, &[]);

    let mut csob_payload = Vec::with_capacity(inner.len() + 4);
    csob_payload.extend_from_slice(&DSO_VERSION.to_le_bytes());
    csob_payload.extend_from_slice(&inner);

    let mut out = Vec::new();
    write_block(&mut out, MAGIC_CSOB, &csob_payload);
    Ok(out)
}

/// Loads a `CodeBlock` previously written by [`save_dso`].
pub fn load_dso(bytes: &[u8]) -> Result<CodeBlock, RuntimeFault> {
    let (magic, csob_payload, _) = read_block(bytes, 0)?;
    if magic != MAGIC_CSOB {
        return Err(RuntimeFault::BadCodeblock(format!(
            "bad container magic {:?}, expected CSOB",
            String::from_utf8_lossy(&magic)
        )));
    }
    let version_bytes: [u8; 4] = csob_payload
        .get(0..4)
        .ok_or_else(|| RuntimeFault::BadCodeblock("truncated CSOB version".into()))?
        .try_into()
        .expect("slice of len 4");
    let version = u32::from_le_bytes(version_bytes);
    if version != DSO_VERSION {
        return Err(RuntimeFault::BadCodeblock(format!("unsupported DSO version {version}")));
    }

    let (dsob_magic, dsob_payload, _) = read_block(csob_payload, 4)?;
    if dsob_magic != MAGIC_DSOB {
        return Err(RuntimeFault::BadCodeblock(format!(
            "expected DSOB block, found {:?}",
            String::from_utf8_lossy(&dsob_magic)
        )));
    }
    postcard::from_bytes(dsob_payload).map_err(postcard_fault)
}

/// Wraps an arbitrary `postcard`-encoded payload in a single framed block,
/// reusing this module's framing for [`crate::serialize`] (spec section
/// 4.10) rather than inventing a second one.
pub(crate) fn frame_payload(magic: [u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    write_block(&mut out, magic, payload);
    out
}

pub(crate) fn read_framed_payload(magic: [u8; 4], bytes: &[u8]) -> Result<&[u8], RuntimeFault> {
    let (found, payload, _) = read_block(bytes, 0)?;
    if found != magic {
        return Err(RuntimeFault::BadCodeblock(format!(
            "bad block magic {:?}, expected {:?}",
            String::from_utf8_lossy(&found),
            String::from_utf8_lossy(&magic)
        )));
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codeblock::LineEntry;

    fn sample() -> CodeBlock {
        CodeBlock::new(
            "test.cs".into(),
            vec![0x01, 0x02, 0x03],
            vec![1.5],
            vec![],
            vec!["foo".into(), "bar".into()],
            vec![],
            vec![LineEntry { ip: 0, line: 1 }],
            0,
        )
    }

    #[test]
    fn dso_round_trips_through_save_and_load() {
        let original = sample();
        let bytes = save_dso(&original).unwrap();
        let loaded = load_dso(&bytes).unwrap();
        assert_eq!(&*loaded.file_name, "test.cs");
        assert_eq!(loaded.code, vec![0x01, 0x02, 0x03]);
        assert_eq!(loaded.global_strings.len(), 2);
    }

    #[test]
    fn odd_length_payload_is_padded_to_two_byte_alignment() {
        let mut buf = Vec::new();
        write_block(&mut buf, MAGIC_DSOB, &[1, 2, 3]);
        assert_eq!(buf.len(), 8 + 3 + 1);
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let bytes = save_dso(&sample()).unwrap();
        let mut corrupted = bytes.clone();
        corrupted[0] = b'X';
        assert!(load_dso(&corrupted).is_err());
    }
}
