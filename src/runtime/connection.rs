//! Line state machine for a single connection.
//!
//! Bytes arrive one at a time and move the session between two states:
//!
//! ```text
//!            printable              printable
//!   Idle ----------------> Accumulating ---+
//!    ^  \                    |   ^         |
//!    |   \ CR/LF: prompt     |   +---------+
//!    |    +-----> Idle       |
//!    +-----------------------+
//!      CR/LF: dispatch, reply, prompt
//! ```
//!
//! Any other byte leaves the state unchanged and produces no output.

use crate::command::{CommandContext, CommandTable};
use crate::shutdown::ShutdownFlag;
use bytes::{BufMut, BytesMut};

/// Prompt sent once a connection is accepted.
pub const GREETING: &[u8] = b">>";

/// Prompt sent after every line terminator.
pub const PROMPT: &[u8] = b"\r\n>>";

/// Separator written ahead of a non-empty command response.
const RESPONSE_PREFIX: &[u8] = b"\r\n";

/// Where the session is within the current line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineState {
    /// No printable bytes since the last terminator.
    Idle,
    /// At least one printable byte is waiting in the line buffer.
    Accumulating,
}

/// How a received byte is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteClass {
    Terminator,
    Printable,
    Other,
}

impl ByteClass {
    pub fn of(byte: u8) -> Self {
        match byte {
            b'\r' | b'\n' => ByteClass::Terminator,
            0x20..=0x7e => ByteClass::Printable,
            _ => ByteClass::Other,
        }
    }
}

/// Per-connection line accumulator.
#[derive(Debug)]
pub struct LineSession {
    state: LineState,
    line: BytesMut,
    response: BytesMut,
}

impl Default for LineSession {
    fn default() -> Self {
        Self::new()
    }
}

impl LineSession {
    pub fn new() -> Self {
        Self {
            state: LineState::Idle,
            line: BytesMut::with_capacity(64),
            response: BytesMut::new(),
        }
    }

    pub fn state(&self) -> LineState {
        self.state
    }

    /// The printable bytes accumulated since the last terminator.
    pub fn pending_line(&self) -> &[u8] {
        &self.line
    }

    /// Feed one received byte, appending whatever the peer should see to
    /// `out`.
    pub fn feed(
        &mut self,
        byte: u8,
        table: &CommandTable,
        shutdown: &ShutdownFlag,
        out: &mut BytesMut,
    ) {
        match (ByteClass::of(byte), self.state) {
            (ByteClass::Printable, _) => {
                out.put_u8(byte);
                self.line.put_u8(byte);
                self.state = LineState::Accumulating;
            }
            (ByteClass::Terminator, LineState::Accumulating) => {
                self.dispatch(table, shutdown, out);
                out.put_slice(PROMPT);
            }
            (ByteClass::Terminator, LineState::Idle) => {
                out.put_slice(PROMPT);
            }
            (ByteClass::Other, _) => {}
        }
    }

    /// Feed a received chunk in order.
    pub fn feed_all(
        &mut self,
        bytes: &[u8],
        table: &CommandTable,
        shutdown: &ShutdownFlag,
        out: &mut BytesMut,
    ) {
        for &byte in bytes {
            self.feed(byte, table, shutdown, out);
        }
    }

    fn dispatch(&mut self, table: &CommandTable, shutdown: &ShutdownFlag, out: &mut BytesMut) {
        self.response.clear();
        let mut ctx = CommandContext {
            output: &mut self.response,
            shutdown,
        };
        table.dispatch(&self.line, &mut ctx);

        if !self.response.is_empty() {
            out.put_slice(RESPONSE_PREFIX);
            out.put_slice(&self.response);
        }

        self.line.clear();
        self.state = LineState::Idle;
    }
}
