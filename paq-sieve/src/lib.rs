//! A restricted sieve (RFC 5228) implementation for filtering at local
//! delivery: `require`, `if`/`elsif`/`else`, `allof`/`anyof`/`not`,
//! `true`/`false`, the tests `address`/`header`/`size`/`exists` with
//! `:is`/`:contains`/`:matches`, and the actions `keep`/`fileinto`/
//! `redirect`/`discard`/`reject`/`vacation` (RFC 5230)/`stop`.
//!
//! Scripts come from untrusted users; every stage is bounded (script
//! size, token count, string and list lengths, nesting depth) and the
//! parser tracks its depth in an explicit counter instead of leaning on
//! the call stack.

pub mod ast;
pub mod eval;
pub mod lexer;
pub mod message;
pub mod parser;

pub use ast::{Action, AddressPart, Command, MatchType, Script, Test};
pub use eval::{evaluate, Outcome};
pub use message::SieveMessage;
pub use parser::{parse, ParseError};

/// Hard bounds enforced while parsing.
pub const MAX_SCRIPT_SIZE: usize = 1024 * 1024;
pub const MAX_TOKENS: usize = 100_000;
pub const MAX_STRING_LEN: usize = 10_000;
pub const MAX_LIST_LEN: usize = 1000;
pub const MAX_DEPTH: usize = 100;
