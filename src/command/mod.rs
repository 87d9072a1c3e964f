//! Command table and line dispatch.
//!
//! A line is split on ASCII whitespace, every token is uppercased and looked
//! up in the table. Known tokens run their action in left-to-right order,
//! each appending to the same response buffer. Unknown tokens are skipped
//! without a reply.
//!
//! ## Built-in commands
//! - `EX`: request shutdown of the whole server
//! - `DIR`: reply with a fixed placeholder line

use crate::shutdown::ShutdownFlag;
use bytes::{BufMut, BytesMut};
use std::collections::BTreeMap;

/// Reply written by `DIR`.
pub const DIR_REPLY: &[u8] = b"Directory...\n";

/// State a command action may touch.
pub struct CommandContext<'a> {
    /// Response bytes for the line being dispatched.
    pub output: &'a mut BytesMut,
    /// Server-wide shutdown flag.
    pub shutdown: &'a ShutdownFlag,
}

/// A command implementation.
pub type Action = fn(&mut CommandContext<'_>);

/// Read-only mapping from uppercased token to action.
///
/// Populated before the server starts and shared between workers through an
/// `Arc`; nothing mutates it afterwards.
#[derive(Clone, Default)]
pub struct CommandTable {
    entries: BTreeMap<&'static str, Action>,
}

impl std::fmt::Debug for CommandTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.entries.keys()).finish()
    }
}

impl CommandTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a table holding the built-in commands.
    pub fn with_builtins() -> Self {
        Self::new().register("EX", exit).register("DIR", dir)
    }

    /// Add a command. Names are matched case-insensitively, so they are
    /// stored uppercase.
    pub fn register(mut self, name: &'static str, action: Action) -> Self {
        debug_assert!(
            name.bytes().all(|b| !b.is_ascii_lowercase()),
            "command names are stored uppercase"
        );
        self.entries.insert(name, action);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up a token, ignoring case.
    pub fn lookup(&self, token: &[u8]) -> Option<Action> {
        let upper = token.to_ascii_uppercase();
        let name = std::str::from_utf8(&upper).ok()?;
        self.entries.get(name).copied()
    }

    /// Run every known token of `line` against `ctx`.
    pub fn dispatch(&self, line: &[u8], ctx: &mut CommandContext<'_>) {
        for token in tokens(line) {
            if let Some(action) = self.lookup(token) {
                action(ctx);
            }
        }
    }
}

/// Split a line on runs of ASCII whitespace, never yielding empty tokens.
pub fn tokens(line: &[u8]) -> impl Iterator<Item = &[u8]> {
    line.split(|b| b.is_ascii_whitespace())
        .filter(|token| !token.is_empty())
}

fn exit(ctx: &mut CommandContext<'_>) {
    ctx.shutdown.request();
}

fn dir(ctx: &mut CommandContext<'_>) {
    ctx.output.put_slice(DIR_REPLY);
}
