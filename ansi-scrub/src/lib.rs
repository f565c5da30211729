//! Removes terminal escape sequences from child-process output before it is
//! parsed as JSON.
//!
//! The agent CLI is started with `TERM=dumb` and color disabled, but shell
//! prologues and Node deprecation banners still leak CSI and OSC sequences
//! onto stdout. This crate implements just enough of ECMA-48 to drop them:
//! a small state machine covering CSI (`ESC [`), OSC (`ESC ]`, terminated by
//! BEL or ST), and two-byte `ESC x` sequences. It is not a terminal
//! emulator and never interprets what it strips.

use std::borrow::Cow;

const ESC: char = '\u{1b}';
const BEL: char = '\u{07}';

#[derive(Clone, Copy, PartialEq)]
enum State {
    Ground,
    Escape,
    Csi,
    Osc,
    /// Inside an OSC sequence, just saw ESC; a following `\` is the ST
    /// terminator, anything else stays part of the OSC payload.
    OscEscape,
}

/// Strip ANSI CSI/OSC escape sequences from `input`.
///
/// Returns a borrowed `Cow` when the input contains no `ESC` byte, which is
/// the common case for well-behaved NDJSON lines.
pub fn scrub(input: &str) -> Cow<'_, str> {
    if !input.contains(ESC) {
        return Cow::Borrowed(input);
    }

    let mut out = String::with_capacity(input.len());
    let mut state = State::Ground;

    for ch in input.chars() {
        match state {
            State::Ground => {
                if ch == ESC {
                    state = State::Escape;
                } else {
                    out.push(ch);
                }
            }
            State::Escape => {
                state = match ch {
                    '[' => State::Csi,
                    ']' => State::Osc,
                    // Two-byte sequence such as `ESC ( B` select-charset: the
                    // intermediate 0x20..=0x2f byte is followed by one final
                    // byte which the Csi arm consumes the same way.
                    '\u{20}'..='\u{2f}' => State::Csi,
                    // Any other final byte ends the sequence immediately.
                    _ => State::Ground,
                };
            }
            State::Csi => {
                // Parameter bytes 0x30..=0x3f and intermediates 0x20..=0x2f
                // are swallowed; a final byte 0x40..=0x7e ends the sequence.
                if ('\u{40}'..='\u{7e}').contains(&ch) {
                    state = State::Ground;
                }
            }
            State::Osc => {
                if ch == BEL {
                    state = State::Ground;
                } else if ch == ESC {
                    state = State::OscEscape;
                }
            }
            State::OscEscape => {
                state = if ch == '\\' { State::Ground } else { State::Osc };
            }
        }
    }

    Cow::Owned(out)
}
