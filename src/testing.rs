//! Helpers for building machine code in tests.

use crate::arch::Bitness;

use iced_x86::{Decoder, DecoderOptions, Instruction};

/// Parses whitespace separated hex bytes, e.g. `"48 8d 8f c0 01 00 00"`.
pub fn hex(s: &str) -> Vec<u8> {
    s.split_whitespace()
        .map(|b| u8::from_str_radix(b, 16).expect("invalid hex byte"))
        .collect()
}

/// `call rel32` located at `ip`, branching to `target`.
pub fn call_rel32(ip: u64, target: u64) -> Vec<u8> {
    let rel = target.wrapping_sub(ip + 5) as u32;
    let mut bytes = vec![0xe8];
    bytes.extend_from_slice(&rel.to_le_bytes());
    bytes
}

pub fn decode(bitness: Bitness, ip: u64, code: &[u8]) -> Vec<Instruction> {
    let mut decoder = Decoder::new(bitness.bits(), code, DecoderOptions::NONE);
    decoder.set_ip(ip);
    decoder.into_iter().collect()
}
