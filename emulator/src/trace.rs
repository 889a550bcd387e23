//! Committed architectural state changes and their text form.
//!
//! The same line format is printed by `-v` and read back from a reference
//! model during cosimulation:
//!
//! ```text
//! swriteback PC THREAD REG VALUE
//! vwriteback PC THREAD REG MASK VALUES
//! store PC THREAD LINEADDR BYTEMASK VALUES
//! ```
//!
//! `VALUES` is 16 lanes of 8 hex digits, lane 0 first. Store byte mask
//! bit `i` covers byte `LINEADDR + i`.

use crate::bus::{CACHE_LINE_SIZE, NUM_VECTOR_LANES};
use std::fmt;
use std::str::FromStr;

pub type Lanes = [u32; NUM_VECTOR_LANES];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitEvent {
    ScalarWrite {
        pc: u32,
        thread: usize,
        reg: u8,
        value: u32,
    },
    VectorWrite {
        pc: u32,
        thread: usize,
        reg: u8,
        mask: u16,
        values: Lanes,
    },
    /// A store, widened to the cache line it touches.
    Store {
        pc: u32,
        thread: usize,
        address: u32,
        mask: u64,
        values: Lanes,
    },
}

/// Byte mask covering every byte of the lanes set in `lane_mask`.
pub fn lane_mask_to_byte_mask(lane_mask: u16) -> u64 {
    (0..NUM_VECTOR_LANES)
        .filter(|lane| lane_mask & (1 << lane) != 0)
        .fold(0u64, |acc, lane| acc | (0xf << (lane * 4)))
}

fn line_byte(values: &Lanes, byte: usize) -> u8 {
    (values[byte / 4] >> ((byte % 4) * 8)) as u8
}

impl CommitEvent {
    /// Normalise a 1, 2 or 4 byte store to a line address and byte mask.
    /// Widths above 4 only cover the bytes `value` holds.
    pub fn scalar_store(pc: u32, thread: usize, address: u32, size: u32, value: u32) -> Self {
        let line = address & !(CACHE_LINE_SIZE - 1);
        let offset = (address - line) as usize;
        let mut values = [0u32; NUM_VECTOR_LANES];
        let mut mask = 0u64;
        for i in 0..size.min(4) as usize {
            let byte = offset + i;
            if byte >= CACHE_LINE_SIZE as usize {
                break;
            }
            let b = (value >> (i * 8)) & 0xff;
            values[byte / 4] |= b << ((byte % 4) * 8);
            mask |= 1 << byte;
        }
        CommitEvent::Store {
            pc,
            thread,
            address: line,
            mask,
            values,
        }
    }

    pub fn pc(&self) -> u32 {
        match *self {
            CommitEvent::ScalarWrite { pc, .. }
            | CommitEvent::VectorWrite { pc, .. }
            | CommitEvent::Store { pc, .. } => pc,
        }
    }

    pub fn thread(&self) -> usize {
        match *self {
            CommitEvent::ScalarWrite { thread, .. }
            | CommitEvent::VectorWrite { thread, .. }
            | CommitEvent::Store { thread, .. } => thread,
        }
    }

    /// Compare against a reference event. Only lanes or bytes selected by
    /// the mask take part in the value comparison.
    pub fn matches(&self, other: &CommitEvent) -> bool {
        match (self, other) {
            (
                CommitEvent::ScalarWrite {
                    pc: p1,
                    thread: t1,
                    reg: r1,
                    value: v1,
                },
                CommitEvent::ScalarWrite {
                    pc: p2,
                    thread: t2,
                    reg: r2,
                    value: v2,
                },
            ) => p1 == p2 && t1 == t2 && r1 == r2 && v1 == v2,
            (
                CommitEvent::VectorWrite {
                    pc: p1,
                    thread: t1,
                    reg: r1,
                    mask: m1,
                    values: v1,
                },
                CommitEvent::VectorWrite {
                    pc: p2,
                    thread: t2,
                    reg: r2,
                    mask: m2,
                    values: v2,
                },
            ) => {
                p1 == p2
                    && t1 == t2
                    && r1 == r2
                    && m1 == m2
                    && (0..NUM_VECTOR_LANES)
                        .filter(|lane| m1 & (1 << lane) != 0)
                        .all(|lane| v1[lane] == v2[lane])
            }
            (
                CommitEvent::Store {
                    pc: p1,
                    thread: t1,
                    address: a1,
                    mask: m1,
                    values: v1,
                },
                CommitEvent::Store {
                    pc: p2,
                    thread: t2,
                    address: a2,
                    mask: m2,
                    values: v2,
                },
            ) => {
                p1 == p2
                    && t1 == t2
                    && a1 == a2
                    && m1 == m2
                    && (0..CACHE_LINE_SIZE as usize)
                        .filter(|byte| m1 & (1 << byte) != 0)
                        .all(|byte| line_byte(v1, byte) == line_byte(v2, byte))
            }
            _ => false,
        }
    }
}

fn encode_lanes(values: &Lanes) -> String {
    let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_be_bytes()).collect();
    hex::encode(bytes)
}

impl fmt::Display for CommitEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommitEvent::ScalarWrite {
                pc,
                thread,
                reg,
                value,
            } => write!(f, "swriteback {:08x} {} {} {:08x}", pc, thread, reg, value),
            CommitEvent::VectorWrite {
                pc,
                thread,
                reg,
                mask,
                values,
            } => write!(
                f,
                "vwriteback {:08x} {} {} {:04x} {}",
                pc,
                thread,
                reg,
                mask,
                encode_lanes(values)
            ),
            CommitEvent::Store {
                pc,
                thread,
                address,
                mask,
                values,
            } => write!(
                f,
                "store {:08x} {} {:08x} {:016x} {}",
                pc,
                thread,
                address,
                mask,
                encode_lanes(values)
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEventError(pub String);

impl fmt::Display for ParseEventError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ParseEventError {}

fn parse_hex<T: TryFrom<u64>>(token: Option<&str>, what: &str) -> Result<T, ParseEventError> {
    let token = token.ok_or_else(|| ParseEventError(format!("missing {}", what)))?;
    let value = u64::from_str_radix(token, 16)
        .map_err(|_| ParseEventError(format!("bad {} '{}'", what, token)))?;
    T::try_from(value).map_err(|_| ParseEventError(format!("{} out of range '{}'", what, token)))
}

fn parse_dec<T: FromStr>(token: Option<&str>, what: &str) -> Result<T, ParseEventError> {
    let token = token.ok_or_else(|| ParseEventError(format!("missing {}", what)))?;
    token
        .parse()
        .map_err(|_| ParseEventError(format!("bad {} '{}'", what, token)))
}

fn parse_lanes(token: Option<&str>) -> Result<Lanes, ParseEventError> {
    let token = token.ok_or_else(|| ParseEventError("missing lane values".to_string()))?;
    let bytes = hex::decode(token).map_err(|e| ParseEventError(format!("bad lane values: {}", e)))?;
    if bytes.len() != NUM_VECTOR_LANES * 4 {
        return Err(ParseEventError(format!(
            "expected {} hex digits of lane values, got {}",
            NUM_VECTOR_LANES * 8,
            token.len()
        )));
    }
    let mut values = [0u32; NUM_VECTOR_LANES];
    for (lane, chunk) in bytes.chunks_exact(4).enumerate() {
        values[lane] = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    Ok(values)
}

impl FromStr for CommitEvent {
    type Err = ParseEventError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut tokens = line.split_whitespace();
        let kind = tokens.next();
        let event = match kind {
            Some("swriteback") => CommitEvent::ScalarWrite {
                pc: parse_hex(tokens.next(), "pc")?,
                thread: parse_dec(tokens.next(), "thread")?,
                reg: parse_dec(tokens.next(), "register")?,
                value: parse_hex(tokens.next(), "value")?,
            },
            Some("vwriteback") => CommitEvent::VectorWrite {
                pc: parse_hex(tokens.next(), "pc")?,
                thread: parse_dec(tokens.next(), "thread")?,
                reg: parse_dec(tokens.next(), "register")?,
                mask: parse_hex(tokens.next(), "mask")?,
                values: parse_lanes(tokens.next())?,
            },
            Some("store") => CommitEvent::Store {
                pc: parse_hex(tokens.next(), "pc")?,
                thread: parse_dec(tokens.next(), "thread")?,
                address: parse_hex(tokens.next(), "address")?,
                mask: parse_hex(tokens.next(), "byte mask")?,
                values: parse_lanes(tokens.next())?,
            },
            _ => return Err(ParseEventError(format!("unknown event '{}'", line))),
        };
        if tokens.next().is_some() {
            return Err(ParseEventError(format!("trailing fields in '{}'", line)));
        }
        Ok(event)
    }
}
