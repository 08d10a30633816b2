//! Consistent Overhead Byte Stuffing with a configurable end-of-packet byte.
//!
//! Every byte written by [`encode`] (run codes included) is XORed with `eop`,
//! so the delimiter value can never appear inside an encoded payload. The card
//! uses `b'\n'` as the delimiter, which lets binary data travel over the same
//! newline-framed channel as the JSON requests.

/// Longest run of non-zero bytes a single code byte can describe.
const MAX_RUN: usize = 254;

/// Worst-case encoded length of `len` input bytes.
pub const fn max_encoded_len(len: usize) -> usize {
    len + 1 + len / MAX_RUN
}

/// Encode `data`, excluding `eop` from the output.
pub fn encode(data: &[u8], eop: u8) -> Vec<u8> {
    let mut encoded = Vec::with_capacity(max_encoded_len(data.len()));
    let mut code: u8 = 1;
    let mut code_index = 0;
    encoded.push(0);

    for &byte in data {
        if byte != 0 {
            encoded.push(byte ^ eop);
            code += 1;
        }
        if byte == 0 || code == 0xFF {
            encoded[code_index] = code ^ eop;
            code = 1;
            code_index = encoded.len();
            encoded.push(0);
        }
    }
    encoded[code_index] = code ^ eop;

    encoded
}

/// Decode a buffer produced by [`encode`] with the same `eop`.
///
/// Decoding stops early at a zero run code, which marks the end of a packet.
pub fn decode(encoded: &[u8], eop: u8) -> Vec<u8> {
    let mut decoded = Vec::with_capacity(encoded.len());
    let mut code: u8 = 0xFF;
    let mut copy: u8 = 0;

    for &byte in encoded {
        if copy != 0 {
            decoded.push(byte ^ eop);
        } else {
            let next = byte ^ eop;
            if next == 0 {
                break;
            }
            // a full 254-byte run carries no implicit zero
            if code != 0xFF {
                decoded.push(0);
            }
            code = next;
            copy = code;
        }
        copy = copy.wrapping_sub(1);
    }

    decoded
}
