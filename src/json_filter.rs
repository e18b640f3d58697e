//! Incremental JSON value tokenizer.
//!
//! # Why
//! A connection speaking newline-free, length-prefix-free JSON-RPC needs to
//! know where one top-level value ends and the next begins without buffering
//! the whole stream. The classic JSON-checker state machine (the same one
//! `json.org` ships) does this with O(1) memory per byte and no recursive
//! descent, which is why the source adopts it verbatim for `EvdJsonFilter`.
//!
//! # How
//! The 128-entry ASCII class table, the 30x31 state transition table
//! (including the negative "action" encoding for state-table entries) and
//! the depth-128 mode stack are carried over from `evd-json-filter.c`
//! unchanged. The `GO` row, however, is wider than the source's: the source
//! only ever framed top-level objects and arrays, so its `GO` row sends a
//! bare value-start byte (a digit, a quote, `t`/`f`/`n`) into the same dead
//! end any other unexpected byte hits. This filter's `feed` also has to
//! frame bare top-level scalars (§4.8, end-to-end test 3's trailing `"x"`),
//! so the `GO` row routes those classes into the scalar states
//! (`ST`/`MI`/`ZE`/`IN`/`F1`/`N1`/`T1`) the table already has for values
//! nested inside arrays and objects, and `process` tracks where such a bare
//! value starts and recognizes where it ends. The other structural change
//! is swapping the `GClosure`-based `on_packet` notification for an
//! explicit return value — `feed` collects emitted packets into a
//! `Vec<Bytes>` — since Rust has no equivalent of inline-invoking a
//! dynamically-typed signal in the middle of a byte loop that's any more
//! idiomatic than just returning the results.
//!
//! # What
//! `feed` guarantees exactly one emission per complete top-level JSON value,
//! in order, byte-identical to the source run that produced it. Malformed
//! input stops emission and returns `InvalidData` at the failing offset
//! without silently consuming more of the buffer.

use bytes::Bytes;

use crate::error::{EvdError, ErrorKind};

const MAX_DEPTH: usize = 128;
const ERR: i32 = -1;

#[rustfmt::skip]
mod classes {
    pub const C_SPACE: i32 = 0;
    pub const C_WHITE: i32 = 1;
    pub const C_LCURB: i32 = 2;
    pub const C_RCURB: i32 = 3;
    pub const C_LSQRB: i32 = 4;
    pub const C_RSQRB: i32 = 5;
    pub const C_COLON: i32 = 6;
    pub const C_COMMA: i32 = 7;
    pub const C_QUOTE: i32 = 8;
    pub const C_BACKS: i32 = 9;
    pub const C_SLASH: i32 = 10;
    pub const C_PLUS: i32 = 11;
    pub const C_MINUS: i32 = 12;
    pub const C_POINT: i32 = 13;
    pub const C_ZERO: i32 = 14;
    pub const C_DIGIT: i32 = 15;
    pub const C_LOW_A: i32 = 16;
    pub const C_LOW_B: i32 = 17;
    pub const C_LOW_C: i32 = 18;
    pub const C_LOW_D: i32 = 19;
    pub const C_LOW_E: i32 = 20;
    pub const C_LOW_F: i32 = 21;
    pub const C_LOW_L: i32 = 22;
    pub const C_LOW_N: i32 = 23;
    pub const C_LOW_R: i32 = 24;
    pub const C_LOW_S: i32 = 25;
    pub const C_LOW_T: i32 = 26;
    pub const C_LOW_U: i32 = 27;
    pub const C_ABCDF: i32 = 28;
    pub const C_E: i32 = 29;
    pub const C_ETC: i32 = 30;
    pub const NR_CLASSES: usize = 31;
}
use classes::*;

#[rustfmt::skip]
static ASCII_CLASS: [i32; 128] = [
    ERR,     ERR,     ERR,     ERR,     ERR,     ERR,     ERR,     ERR,
    ERR,     C_WHITE, C_WHITE, ERR,     ERR,     C_WHITE, ERR,     ERR,
    ERR,     ERR,     ERR,     ERR,     ERR,     ERR,     ERR,     ERR,
    ERR,     ERR,     ERR,     ERR,     ERR,     ERR,     ERR,     ERR,

    C_SPACE, C_ETC,   C_QUOTE, C_ETC,   C_ETC,   C_ETC,   C_ETC,   C_ETC,
    C_ETC,   C_ETC,   C_ETC,   C_PLUS,  C_COMMA, C_MINUS, C_POINT, C_SLASH,
    C_ZERO,  C_DIGIT, C_DIGIT, C_DIGIT, C_DIGIT, C_DIGIT, C_DIGIT, C_DIGIT,
    C_DIGIT, C_DIGIT, C_COLON, C_ETC,   C_ETC,   C_ETC,   C_ETC,   C_ETC,

    C_ETC,   C_ABCDF, C_ABCDF, C_ABCDF, C_ABCDF, C_E,     C_ABCDF, C_ETC,
    C_ETC,   C_ETC,   C_ETC,   C_ETC,   C_ETC,   C_ETC,   C_ETC,   C_ETC,
    C_ETC,   C_ETC,   C_ETC,   C_ETC,   C_ETC,   C_ETC,   C_ETC,   C_ETC,
    C_ETC,   C_ETC,   C_ETC,   C_LSQRB, C_BACKS, C_RSQRB, C_ETC,   C_ETC,

    C_ETC,   C_LOW_A, C_LOW_B, C_LOW_C, C_LOW_D, C_LOW_E, C_LOW_F, C_ETC,
    C_ETC,   C_ETC,   C_ETC,   C_ETC,   C_LOW_L, C_ETC,   C_LOW_N, C_ETC,
    C_ETC,   C_ETC,   C_LOW_R, C_LOW_S, C_LOW_T, C_LOW_U, C_ETC,   C_ETC,
    C_ETC,   C_ETC,   C_ETC,   C_LCURB, C_ETC,   C_RCURB, C_ETC,   C_ETC,
];

#[rustfmt::skip]
mod states {
    pub const GO: i32 = 0;
    pub const OK: i32 = 1;
    pub const OB: i32 = 2;
    pub const KE: i32 = 3;
    pub const CO: i32 = 4;
    pub const VA: i32 = 5;
    pub const AR: i32 = 6;
    pub const ST: i32 = 7;
    pub const ES: i32 = 8;
    pub const U1: i32 = 9;
    pub const U2: i32 = 10;
    pub const U3: i32 = 11;
    pub const U4: i32 = 12;
    pub const MI: i32 = 13;
    pub const ZE: i32 = 14;
    pub const IN: i32 = 15;
    pub const FR: i32 = 16;
    pub const E1: i32 = 17;
    pub const E2: i32 = 18;
    pub const E3: i32 = 19;
    pub const T1: i32 = 20;
    pub const T2: i32 = 21;
    pub const T3: i32 = 22;
    pub const F1: i32 = 23;
    pub const F2: i32 = 24;
    pub const F3: i32 = 25;
    pub const F4: i32 = 26;
    pub const N1: i32 = 27;
    pub const N2: i32 = 28;
    pub const N3: i32 = 29;
    pub const NR_STATES: usize = 30;
}
use states::*;

const __: i32 = ERR;

#[rustfmt::skip]
static STATE_TRANSITION_TABLE: [[i32; NR_CLASSES]; NR_STATES] = [
/*start  GO*/ [GO,GO,-6,__,-5,__,__,__,ST,__,__,__,MI,__,ZE,IN,__,__,__,__,__,F1,__,N1,__,__,T1,__,__,__,__],
/*ok     OK*/ [OK,OK,__,-8,__,-7,__,-3,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__],
/*object OB*/ [OB,OB,__,-9,__,__,__,__,ST,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__],
/*key    KE*/ [KE,KE,__,__,__,__,__,__,ST,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__],
/*colon  CO*/ [CO,CO,__,__,__,__,-2,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__],
/*value  VA*/ [VA,VA,-6,__,-5,__,__,__,ST,__,__,__,MI,__,ZE,IN,__,__,__,__,__,F1,__,N1,__,__,T1,__,__,__,__],
/*array  AR*/ [AR,AR,-6,__,-5,-7,__,__,ST,__,__,__,MI,__,ZE,IN,__,__,__,__,__,F1,__,N1,__,__,T1,__,__,__,__],
/*string ST*/ [ST,__,ST,ST,ST,ST,ST,ST,-4,ES,ST,ST,ST,ST,ST,ST,ST,ST,ST,ST,ST,ST,ST,ST,ST,ST,ST,ST,ST,ST,ST],
/*escape ES*/ [__,__,__,__,__,__,__,__,ST,ST,ST,__,__,__,__,__,__,ST,__,__,__,ST,__,ST,ST,__,ST,U1,__,__,__],
/*u1     U1*/ [__,__,__,__,__,__,__,__,__,__,__,__,__,__,U2,U2,U2,U2,U2,U2,U2,U2,__,__,__,__,__,__,U2,U2,__],
/*u2     U2*/ [__,__,__,__,__,__,__,__,__,__,__,__,__,__,U3,U3,U3,U3,U3,U3,U3,U3,__,__,__,__,__,__,U3,U3,__],
/*u3     U3*/ [__,__,__,__,__,__,__,__,__,__,__,__,__,__,U4,U4,U4,U4,U4,U4,U4,U4,__,__,__,__,__,__,U4,U4,__],
/*u4     U4*/ [__,__,__,__,__,__,__,__,__,__,__,__,__,__,ST,ST,ST,ST,ST,ST,ST,ST,__,__,__,__,__,__,ST,ST,__],
/*minus  MI*/ [__,__,__,__,__,__,__,__,__,__,__,__,__,__,ZE,IN,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__],
/*zero   ZE*/ [OK,OK,__,-8,__,-7,__,-3,__,__,__,__,__,FR,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__],
/*int    IN*/ [OK,OK,__,-8,__,-7,__,-3,__,__,__,__,__,FR,IN,IN,__,__,__,__,E1,__,__,__,__,__,__,__,__,E1,__],
/*frac   FR*/ [OK,OK,__,-8,__,-7,__,-3,__,__,__,__,__,__,FR,FR,__,__,__,__,E1,__,__,__,__,__,__,__,__,E1,__],
/*e      E1*/ [__,__,__,__,__,__,__,__,__,__,__,E2,E2,__,E3,E3,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__],
/*ex     E2*/ [__,__,__,__,__,__,__,__,__,__,__,__,__,__,E3,E3,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__],
/*exp    E3*/ [OK,OK,__,-8,__,-7,__,-3,__,__,__,__,__,__,E3,E3,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__],
/*tr     T1*/ [__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,T2,__,__,__,__,__,__],
/*tru    T2*/ [__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,T3,__,__,__],
/*true   T3*/ [__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,OK,__,__,__,__,__,__,__,__,__,__],
/*fa     F1*/ [__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,F2,__,__,__,__,__,__,__,__,__,__,__,__,__,__],
/*fal    F2*/ [__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,F3,__,__,__,__,__,__,__,__],
/*fals   F3*/ [__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,F4,__,__,__,__,__],
/*false  F4*/ [__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,OK,__,__,__,__,__,__,__,__,__,__],
/*nu     N1*/ [__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,N2,__,__,__],
/*nul    N2*/ [__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,N3,__,__,__,__,__,__,__,__],
/*null   N3*/ [__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,__,OK,__,__,__,__,__,__,__,__],
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Array,
    Done,
    Key,
    Object,
}

/// Outcome of feeding one byte through the transition table.
enum Step {
    /// Still inside, or between, top-level values.
    Continue,
    /// A top-level value just completed. `include_byte` is false only when
    /// the byte that drove the transition is the whitespace that terminates
    /// a bare number — the table treats that whitespace as a delimiter, not
    /// part of the value, unlike a string's closing quote or a keyword's own
    /// last letter (both of which complete the value on the byte itself).
    ValueComplete { include_byte: bool },
}

/// Incremental tokenizer that emits complete top-level JSON values.
pub struct JsonFilter {
    state: i32,
    depth: usize,
    top: isize,
    stack: [Mode; MAX_DEPTH],
    content_start: isize,
    cache: Vec<u8>,
}

impl Default for JsonFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl JsonFilter {
    pub fn new() -> Self {
        let mut f = Self {
            state: GO,
            depth: MAX_DEPTH,
            top: -1,
            stack: [Mode::Done; MAX_DEPTH],
            content_start: -1,
            cache: Vec::new(),
        };
        f.reset();
        f
    }

    /// Clears parser state and the partial-frame cache. Safe at any point.
    pub fn reset(&mut self) {
        self.state = GO;
        self.depth = MAX_DEPTH;
        self.top = -1;
        self.content_start = -1;
        self.push(Mode::Done);
    }

    fn push(&mut self, mode: Mode) -> bool {
        self.top += 1;
        if self.top as usize >= self.depth {
            return false;
        }
        self.stack[self.top as usize] = mode;
        true
    }

    fn pop(&mut self, mode: Mode) -> bool {
        if self.top < 0 || self.stack[self.top as usize] != mode {
            return false;
        }
        self.top -= 1;
        true
    }

    fn top_mode(&self) -> Mode {
        self.stack[self.top as usize]
    }

    fn fail(&mut self, offset: usize) -> EvdError {
        self.reset();
        EvdError::new(ErrorKind::InvalidData, format!("malformed JSON sequence at offset {offset}"))
    }

    fn process(&mut self, byte: u8, offset: usize) -> Result<Step, EvdError> {
        let class = if byte >= 128 {
            C_ETC
        } else {
            let c = ASCII_CLASS[byte as usize];
            if c <= __ {
                return Err(self.fail(offset));
            }
            c
        };

        let current_state = self.state;
        let next_state = STATE_TRANSITION_TABLE[current_state as usize][class as usize];
        if next_state >= 0 {
            if current_state == GO
                && self.content_start == -1
                && matches!(next_state, ST | MI | ZE | IN | F1 | N1 | T1)
            {
                self.content_start = offset as isize;
            }
            self.state = next_state;
            if next_state == OK && self.top_mode() == Mode::Done {
                let include_byte = !matches!(class, C_SPACE | C_WHITE);
                return Ok(Step::ValueComplete { include_byte });
            }
            return Ok(Step::Continue);
        }

        if self.content_start == -1 {
            self.content_start = offset as isize;
        }

        match next_state {
            -9 => {
                if !self.pop(Mode::Key) {
                    return Err(self.fail(offset));
                }
                self.state = OK;
            }
            -8 => {
                if !self.pop(Mode::Object) {
                    return Err(self.fail(offset));
                }
                self.state = OK;
            }
            -7 => {
                if !self.pop(Mode::Array) {
                    return Err(self.fail(offset));
                }
                self.state = OK;
            }
            -6 => {
                if !self.push(Mode::Key) {
                    return Err(self.fail(offset));
                }
                self.state = OB;
            }
            -5 => {
                if !self.push(Mode::Array) {
                    return Err(self.fail(offset));
                }
                self.state = AR;
            }
            -4 => {
                self.state = match self.top_mode() {
                    Mode::Key => CO,
                    Mode::Array | Mode::Object => OK,
                    // A bare top-level string's closing quote: the quote
                    // itself completes the value, same as `-7`/`-8` closing
                    // a container.
                    Mode::Done => OK,
                };
            }
            -3 => match self.top_mode() {
                Mode::Object => {
                    if !self.pop(Mode::Object) || !self.push(Mode::Key) {
                        return Err(self.fail(offset));
                    }
                    self.state = KE;
                }
                Mode::Array => self.state = VA,
                _ => return Err(self.fail(offset)),
            },
            -2 => {
                if !self.pop(Mode::Key) || !self.push(Mode::Object) {
                    return Err(self.fail(offset));
                }
                self.state = VA;
            }
            _ => return Err(self.fail(offset)),
        }

        if self.state == OK && self.top_mode() == Mode::Done {
            Ok(Step::ValueComplete { include_byte: true })
        } else {
            Ok(Step::Continue)
        }
    }

    /// Feed a chunk of bytes, returning every complete top-level JSON value
    /// that was found, in order. An error stops emission at the failing
    /// offset; the filter has already been reset by the time it returns.
    pub fn feed(&mut self, buffer: &[u8]) -> Result<Vec<Bytes>, EvdError> {
        let mut packets = Vec::new();
        let mut i = 0usize;
        while i < buffer.len() {
            match self.process(buffer[i], i)? {
                Step::Continue => {}
                Step::ValueComplete { include_byte } => {
                    let end = if include_byte { i + 1 } else { i };
                    if !self.cache.is_empty() {
                        self.cache.extend_from_slice(&buffer[..end]);
                        packets.push(Bytes::from(std::mem::take(&mut self.cache)));
                    } else {
                        let start = self.content_start as usize;
                        packets.push(Bytes::copy_from_slice(&buffer[start..end]));
                    }
                    self.reset();
                }
            }
            i += 1;
        }

        if self.content_start >= 0 {
            let start = self.content_start as usize;
            self.cache.extend_from_slice(&buffer[start..]);
            self.content_start = 0;
        }

        Ok(packets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_object_in_one_chunk() {
        let mut f = JsonFilter::new();
        let packets = f.feed(br#"{"a":1}"#).unwrap();
        assert_eq!(packets, vec![Bytes::from_static(br#"{"a":1}"#)]);
    }

    #[test]
    fn three_values_back_to_back() {
        let mut f = JsonFilter::new();
        let packets = f.feed(br#"{"a":1}[1,2,3]"x""#).unwrap();
        assert_eq!(
            packets,
            vec![
                Bytes::from_static(br#"{"a":1}"#),
                Bytes::from_static(b"[1,2,3]"),
                Bytes::from_static(b"\"x\""),
            ]
        );
    }

    #[test]
    fn split_after_every_byte() {
        let mut f = JsonFilter::new();
        let input: &[u8] = br#"{"a":1}[1,2,3]"x""#;
        let mut packets = Vec::new();
        for &b in input {
            packets.extend(f.feed(&[b]).unwrap());
        }
        assert_eq!(
            packets,
            vec![
                Bytes::from_static(br#"{"a":1}"#),
                Bytes::from_static(b"[1,2,3]"),
                Bytes::from_static(b"\"x\""),
            ]
        );
    }

    #[test]
    fn bare_top_level_scalars_back_to_back() {
        let mut f = JsonFilter::new();
        let packets = f.feed(b"42 true[1]").unwrap();
        assert_eq!(
            packets,
            vec![
                Bytes::from_static(b"42"),
                Bytes::from_static(b"true"),
                Bytes::from_static(b"[1]"),
            ]
        );
    }

    #[test]
    fn malformed_input_errors_at_offset() {
        let mut f = JsonFilter::new();
        let err = f.feed(b"{bad}").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn resets_after_error_and_accepts_new_value() {
        let mut f = JsonFilter::new();
        assert!(f.feed(b"{bad").is_err());
        let packets = f.feed(b"true").unwrap();
        assert_eq!(packets, vec![Bytes::from_static(b"true")]);
    }

    #[test]
    fn nested_depth_within_limit() {
        let mut f = JsonFilter::new();
        let nested = "[".repeat(50) + &"]".repeat(50);
        let packets = f.feed(nested.as_bytes()).unwrap();
        assert_eq!(packets.len(), 1);
    }

    #[test]
    fn leading_whitespace_is_part_of_emission_boundary_not_packet() {
        let mut f = JsonFilter::new();
        let packets = f.feed(b"   42   ").unwrap();
        assert_eq!(packets, vec![Bytes::from_static(b"42")]);
    }
}
