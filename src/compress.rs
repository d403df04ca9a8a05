//! Stateless block compression codec (C8): LZ77-family with a 15-bit
//! window and a CRC32-prefixed, self-delimiting output (spec §4.8).

use crate::error::{Error, Result};

const WINDOW_SIZE: usize = 1 << 15;
const MIN_MATCH: usize = 3;
const MAX_MATCH: usize = 258;
const HEADER_SIZE: usize = 8;

const TOKEN_LITERAL: u8 = 0;
const TOKEN_MATCH: u8 = 1;

/// `compress(in) -> out`. Output layout: CRC32 of `input` (4 bytes LE),
/// original length (4 bytes LE), then a token stream of literals and
/// back-references. Self-delimiting: a decoder needs only the header,
/// never an external length.
pub fn compress(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len() / 2 + HEADER_SIZE);
    out.extend_from_slice(&crc32fast::hash(input).to_le_bytes());
    out.extend_from_slice(&(input.len() as u32).to_le_bytes());

    let mut i = 0;
    while i < input.len() {
        let (len, dist) = find_longest_match(input, i);
        if len >= MIN_MATCH {
            out.push(TOKEN_MATCH);
            out.extend_from_slice(&(dist as u16).to_le_bytes());
            out.extend_from_slice(&(len as u16).to_le_bytes());
            i += len;
        } else {
            out.push(TOKEN_LITERAL);
            out.push(input[i]);
            i += 1;
        }
    }
    out
}

fn find_longest_match(input: &[u8], pos: usize) -> (usize, usize) {
    let window_start = pos.saturating_sub(WINDOW_SIZE);
    let max_len = (input.len() - pos).min(MAX_MATCH);
    let mut best_len = 0;
    let mut best_dist = 0;

    let mut j = pos;
    while j > window_start {
        j -= 1;
        let mut len = 0;
        while len < max_len && input[j + len] == input[pos + len] {
            len += 1;
        }
        if len > best_len {
            best_len = len;
            best_dist = pos - j;
            if len == max_len {
                break;
            }
        }
    }
    (best_len, best_dist)
}

/// `decompress(in, max_out) -> out`. Fails [`Error::DecompressionFailed`]
/// if the declared original length exceeds `max_out`, if the token
/// stream is malformed, or if the reconstructed bytes don't match the
/// stored CRC32.
pub fn decompress(input: &[u8], max_out: usize) -> Result<Vec<u8>> {
    if input.len() < HEADER_SIZE {
        return Err(Error::DecompressionFailed("input shorter than header".into()));
    }
    let expected_crc = u32::from_le_bytes(input[0..4].try_into().unwrap());
    let orig_len = u32::from_le_bytes(input[4..8].try_into().unwrap()) as usize;
    if orig_len > max_out {
        return Err(Error::DecompressionFailed(format!(
            "declared length {orig_len} exceeds max_out {max_out}"
        )));
    }

    let mut out = Vec::with_capacity(orig_len);
    let mut pos = HEADER_SIZE;
    while out.len() < orig_len {
        let flag = *input
            .get(pos)
            .ok_or_else(|| Error::DecompressionFailed("truncated token stream".into()))?;
        pos += 1;
        match flag {
            TOKEN_LITERAL => {
                let byte = *input
                    .get(pos)
                    .ok_or_else(|| Error::DecompressionFailed("truncated literal".into()))?;
                pos += 1;
                out.push(byte);
            }
            TOKEN_MATCH => {
                let dist_bytes = input
                    .get(pos..pos + 2)
                    .ok_or_else(|| Error::DecompressionFailed("truncated match distance".into()))?;
                let dist = u16::from_le_bytes(dist_bytes.try_into().unwrap()) as usize;
                pos += 2;
                let len_bytes = input
                    .get(pos..pos + 2)
                    .ok_or_else(|| Error::DecompressionFailed("truncated match length".into()))?;
                let len = u16::from_le_bytes(len_bytes.try_into().unwrap()) as usize;
                pos += 2;
                if dist == 0 || dist > out.len() {
                    return Err(Error::DecompressionFailed(format!(
                        "back-reference distance {dist} exceeds output so far ({})",
                        out.len()
                    )));
                }
                let start = out.len() - dist;
                for k in 0..len {
                    let byte = out[start + k];
                    out.push(byte);
                }
            }
            other => {
                return Err(Error::DecompressionFailed(format!("unknown token flag {other}")));
            }
        }
    }

    if out.len() != orig_len {
        return Err(Error::DecompressionFailed("token stream overshot declared length".into()));
    }
    let actual_crc = crc32fast::hash(&out);
    if actual_crc != expected_crc {
        return Err(Error::DecompressionFailed("CRC32 mismatch".into()));
    }
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn roundtrip_repetitive_input() {
        let input: Vec<u8> = b"abababababababababab".to_vec();
        let compressed = compress(&input);
        let decompressed = decompress(&compressed, input.len()).unwrap();
        assert_eq!(decompressed, input);
    }

    #[test]
    fn roundtrip_incompressible_input() {
        let input: Vec<u8> = (0u8..=255).collect();
        let compressed = compress(&input);
        let decompressed = decompress(&compressed, input.len()).unwrap();
        assert_eq!(decompressed, input);
    }

    #[test]
    fn roundtrip_empty_input() {
        let input: Vec<u8> = Vec::new();
        let compressed = compress(&input);
        let decompressed = decompress(&compressed, 0).unwrap();
        assert_eq!(decompressed, input);
    }

    #[test]
    fn decompress_rejects_declared_length_over_max_out() {
        let input = vec![0u8; 100];
        let compressed = compress(&input);
        assert!(matches!(decompress(&compressed, 10), Err(Error::DecompressionFailed(_))));
    }

    #[test]
    fn decompress_rejects_corrupt_crc() {
        let input = b"hello world hello world".to_vec();
        let mut compressed = compress(&input);
        let last = compressed.len() - 1;
        compressed[last] ^= 0xFF;
        assert!(decompress(&compressed, input.len()).is_err());
    }
}
