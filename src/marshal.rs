//! Bulk-buffer marshalling.
//!
//! A data buffer travels in one of three ways, chosen up front from its
//! length: not at all (empty), inline inside the control message (small
//! buffers), or as a bulk transfer. The bulk path carves the buffer into
//! an alignment-friendly middle that goes over the bulk channel and two
//! short unaligned edges (prologue and trailer) that ride along inside
//! the control message as fixups. The receiver reassembles the three
//! pieces into one contiguous destination.
//!
//! The side structure describing a transfer has a fixed byte layout so
//! both sides of the link agree on it regardless of compiler:
//!
//! ```text
//! [method u8][total_len u32 LE]                      header, always
//! inline: followed by total_len data bytes
//! bulk:   followed by [pro_len u8][trail_len u8]
//!         [prologue,  FIXUP_MAX bytes reserved]
//!         [trailer,   FIXUP_MAX bytes reserved]
//! ```

use crate::error::{Error, Result};

/// Bulk-channel alignment in bytes. The middle piece of a bulk transfer
/// starts and ends on this boundary.
pub const BULK_ALIGN: usize = 16;

/// Largest buffer sent inline inside the control message.
pub const MAX_INLINE: usize = 256;

/// Largest prologue or trailer fixup, `BULK_ALIGN - 1`.
pub const FIXUP_MAX: usize = BULK_ALIGN - 1;

/// Serialized size of a bulk transfer descriptor.
pub const BULK_XFER_SIZE: usize = 7 + 2 * FIXUP_MAX;

/// Largest serialized transfer descriptor (the inline case).
pub const XFER_MAX_SIZE: usize = 5 + MAX_INLINE;

const METHOD_EMPTY: u8 = 0;
const METHOD_INLINE: u8 = 1;
const METHOD_BULK: u8 = 2;

const HDR: usize = 5;

/// How a buffer will travel, decided from its length and address.
#[derive(Debug, PartialEq, Eq)]
pub enum XferPlan<'a> {
    /// Nothing to carry.
    Empty,
    /// The whole buffer rides in the control message.
    Inline(&'a [u8]),
    /// Aligned middle over the bulk channel, edges as fixups.
    Bulk {
        prologue: &'a [u8],
        middle: &'a [u8],
        trailer: &'a [u8],
    },
}

/// Decide how `data` will travel. The inline-versus-bulk choice depends
/// only on the length; the split additionally depends on the buffer's
/// address.
pub fn plan(data: &[u8]) -> XferPlan<'_> {
    if data.is_empty() {
        XferPlan::Empty
    } else if data.len() <= MAX_INLINE {
        XferPlan::Inline(data)
    } else {
        let (prologue, middle, trailer) = split(data);
        XferPlan::Bulk {
            prologue,
            middle,
            trailer,
        }
    }
}

/// Split `data` at [`BULK_ALIGN`] boundaries of its address.
///
/// The middle slice starts and ends on an aligned address; the edges
/// are at most `BULK_ALIGN - 1` bytes each. A buffer too small or too
/// awkwardly placed to contain an aligned middle degenerates to
/// prologue plus trailer with an empty middle.
pub fn split(data: &[u8]) -> (&[u8], &[u8], &[u8]) {
    let start = data.as_ptr() as usize;
    let end = start + data.len();
    let aligned_start = (start + BULK_ALIGN - 1) & !(BULK_ALIGN - 1);
    let aligned_end = end & !(BULK_ALIGN - 1);
    if aligned_end <= aligned_start {
        // No aligned middle fits. Everything becomes fixups; the buffer
        // is short enough that both halves stay within FIXUP_MAX.
        let pro = (aligned_start - start).min(data.len());
        let (prologue, trailer) = data.split_at(pro);
        (prologue, &[], trailer)
    } else {
        let pro = aligned_start - start;
        let mid = aligned_end - aligned_start;
        let (prologue, rest) = data.split_at(pro);
        let (middle, trailer) = rest.split_at(mid);
        (prologue, middle, trailer)
    }
}

/// Serialize the transfer descriptor for `plan` into `out`, returning
/// the number of bytes written.
///
/// `out` must hold at least `HDR + total_len` bytes for an inline plan
/// and [`BULK_XFER_SIZE`] bytes for a bulk plan.
pub fn encode(plan: &XferPlan<'_>, out: &mut [u8]) -> usize {
    match plan {
        XferPlan::Empty => {
            out[0] = METHOD_EMPTY;
            out[1..HDR].copy_from_slice(&0u32.to_le_bytes());
            HDR
        }
        XferPlan::Inline(data) => {
            out[0] = METHOD_INLINE;
            out[1..HDR].copy_from_slice(&(data.len() as u32).to_le_bytes());
            out[HDR..HDR + data.len()].copy_from_slice(data);
            HDR + data.len()
        }
        XferPlan::Bulk {
            prologue,
            middle,
            trailer,
        } => {
            let total = prologue.len() + middle.len() + trailer.len();
            out[0] = METHOD_BULK;
            out[1..HDR].copy_from_slice(&(total as u32).to_le_bytes());
            out[HDR] = prologue.len() as u8;
            out[HDR + 1] = trailer.len() as u8;
            let pro_at = HDR + 2;
            let trail_at = pro_at + FIXUP_MAX;
            out[pro_at..pro_at + prologue.len()].copy_from_slice(prologue);
            out[trail_at..trail_at + trailer.len()].copy_from_slice(trailer);
            // Reserved fixup bytes past the actual edges are left as-is;
            // the receiver only reads the declared lengths.
            BULK_XFER_SIZE
        }
    }
}

/// A decoded transfer descriptor, borrowing from the received message.
#[derive(Debug, PartialEq, Eq)]
pub enum DecodedXfer<'a> {
    /// Nothing was carried.
    Empty,
    /// The data arrived inline.
    Inline(&'a [u8]),
    /// An aligned middle is in flight on the bulk channel; the edges
    /// arrived as fixups.
    Bulk {
        total_len: usize,
        prologue: &'a [u8],
        trailer: &'a [u8],
    },
}

/// Parse a transfer descriptor received inside a control message.
pub fn decode(bytes: &[u8]) -> Result<DecodedXfer<'_>> {
    if bytes.len() < HDR {
        return Err(Error::Protocol("transfer descriptor shorter than its header"));
    }
    let method = bytes[0];
    let total_len = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;
    match method {
        METHOD_EMPTY => Ok(DecodedXfer::Empty),
        METHOD_INLINE => {
            if total_len > MAX_INLINE || bytes.len() < HDR + total_len {
                return Err(Error::Protocol("inline transfer length out of range"));
            }
            Ok(DecodedXfer::Inline(&bytes[HDR..HDR + total_len]))
        }
        METHOD_BULK => {
            if bytes.len() < BULK_XFER_SIZE {
                return Err(Error::Protocol("truncated bulk transfer descriptor"));
            }
            let pro_len = bytes[HDR] as usize;
            let trail_len = bytes[HDR + 1] as usize;
            if pro_len > FIXUP_MAX || trail_len > FIXUP_MAX || pro_len + trail_len > total_len {
                return Err(Error::Protocol("bulk fixup lengths out of range"));
            }
            let pro_at = HDR + 2;
            let trail_at = pro_at + FIXUP_MAX;
            Ok(DecodedXfer::Bulk {
                total_len,
                prologue: &bytes[pro_at..pro_at + pro_len],
                trailer: &bytes[trail_at..trail_at + trail_len],
            })
        }
        _ => Err(Error::Protocol("unknown transfer method")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Returns a slice of `len` bytes whose address is `misalign` bytes
    // past a BULK_ALIGN boundary, counting upward from 0.
    fn misaligned(backing: &mut Vec<u8>, misalign: usize, len: usize) -> &[u8] {
        backing.clear();
        backing.resize(len + 2 * BULK_ALIGN, 0);
        for (i, b) in backing.iter_mut().enumerate() {
            *b = i as u8;
        }
        let base = backing.as_ptr() as usize;
        let aligned = (base + BULK_ALIGN - 1) & !(BULK_ALIGN - 1);
        let off = aligned - base + misalign;
        &backing[off..off + len]
    }

    #[test]
    fn test_plan_inline_boundary() {
        let data = vec![1u8; MAX_INLINE];
        assert!(matches!(plan(&data), XferPlan::Inline(_)));
        let data = vec![1u8; MAX_INLINE + 1];
        assert!(matches!(plan(&data), XferPlan::Bulk { .. }));
        assert_eq!(plan(&[]), XferPlan::Empty);
    }

    #[test]
    fn test_split_alignment_properties() {
        let mut backing = Vec::new();
        for misalign in [0usize, 1, 7, 15] {
            let data = misaligned(&mut backing, misalign, 1000);
            let (pro, mid, trail) = split(data);
            assert_eq!(pro.len() + mid.len() + trail.len(), data.len());
            assert_eq!(mid.as_ptr() as usize % BULK_ALIGN, 0);
            assert_eq!(mid.len() % BULK_ALIGN, 0);
            assert!(pro.len() <= FIXUP_MAX);
            assert!(trail.len() <= FIXUP_MAX);
        }
    }

    #[test]
    fn test_split_degenerate_small_buffer() {
        // A buffer shorter than one alignment unit sitting just past a
        // boundary has no aligned middle at all.
        let mut backing = Vec::new();
        let data = misaligned(&mut backing, 1, 10);
        let (pro, mid, trail) = split(data);
        assert!(mid.is_empty());
        assert_eq!(pro.len() + trail.len(), 10);
        assert!(pro.len() <= FIXUP_MAX);
        assert!(trail.len() <= FIXUP_MAX);
    }

    #[test]
    fn test_encode_decode_inline() {
        let data: Vec<u8> = (0..100u8).collect();
        let p = plan(&data);
        let mut out = [0u8; HDR + MAX_INLINE];
        let n = encode(&p, &mut out);
        match decode(&out[..n]).unwrap() {
            DecodedXfer::Inline(d) => assert_eq!(d, &data[..]),
            other => panic!("expected inline, got {:?}", other),
        }
    }

    #[test]
    fn test_encode_decode_bulk() {
        let mut backing = Vec::new();
        let data = misaligned(&mut backing, 3, 700);
        let p = plan(data);
        let (pro, mid, trail) = split(data);
        let mut out = [0u8; BULK_XFER_SIZE];
        let n = encode(&p, &mut out);
        assert_eq!(n, BULK_XFER_SIZE);
        match decode(&out[..n]).unwrap() {
            DecodedXfer::Bulk {
                total_len,
                prologue,
                trailer,
            } => {
                assert_eq!(total_len, data.len());
                assert_eq!(prologue, pro);
                assert_eq!(trailer, trail);
                assert_eq!(total_len - prologue.len() - trailer.len(), mid.len());
            }
            other => panic!("expected bulk, got {:?}", other),
        }
    }

    #[test]
    fn test_encode_decode_empty() {
        let mut out = [0u8; HDR];
        let n = encode(&XferPlan::Empty, &mut out);
        assert_eq!(decode(&out[..n]).unwrap(), DecodedXfer::Empty);
    }

    #[test]
    fn test_decode_rejects_bad_method() {
        let mut out = [0u8; HDR];
        out[0] = 9;
        assert!(decode(&out).is_err());
    }

    #[test]
    fn test_decode_rejects_bad_fixups() {
        let mut out = [0u8; BULK_XFER_SIZE];
        out[0] = METHOD_BULK;
        out[1..5].copy_from_slice(&500u32.to_le_bytes());
        out[5] = (FIXUP_MAX + 1) as u8;
        assert!(decode(&out).is_err());
    }
}
