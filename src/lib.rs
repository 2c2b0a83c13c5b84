//! # binscope: declarative binary-format grammars
//!
//! Describe a binary layout as a tree of instructions and run it over a byte buffer to
//! get an annotated tree of byte/bit ranges. Sizes and conditions may refer to fields
//! that are parsed *later*; a cooperative scheduler suspends the waiting branch and
//! resumes it once the value is known.
//!
//! ## Instructions
//!
//! - **fixed**: a sized field, optionally decoded by a named codec and checked by
//!   constraints (`zero`, `equals(..)`)
//! - **container**: a group of instructions; sized up front, or sized by its content
//! - **repeat**: runs `do` until the `until` probe parses cleanly
//! - **if**: runs its block when the condition is non-zero
//!
//! ## Example grammar
//!
//! ```text
//! container hdr {
//!     fixed id : 2 bytes as int;
//!     fixed len : 1 byte as u8;
//! }
//! fixed payload : (hdr/len) bytes;
//! repeat items until { fixed : 1 byte [zero]; } do { fixed : 1 byte as u8; }
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! let grammar = binscope::parse("fixed id : 2 bytes as int;").unwrap();
//! let parser = binscope::Parser::new(&grammar).unwrap();
//! let tree = parser.parse(&[0x1F, 0x8B]).unwrap();
//! println!("{}", binscope::dump::render(&tree));
//! ```

pub mod abt;
pub mod ast;
pub mod codec;
pub mod dump;
pub mod expr;
pub mod offset;
pub mod parser;
pub mod scheduler;
pub mod scope;
pub mod thread;
pub mod value;

pub use abt::{AbtNode, AbtRoot};
pub use ast::{CodecDef, Constraint, Grammar, Instruction, InstructionKind, Size, Unit};
pub use codec::{Codec, CodecError, CodecLibrary, FnCodec};
pub use expr::{ExprError, Expression};
pub use offset::Offset;
pub use parser::{load, parse};
pub use scheduler::{ParseError, Parser, ParserConfig};
pub use value::Value;

/// Parse `source` as a grammar and run it over `data` with the built-in codecs.
pub fn parse_bytes(source: &str, data: &[u8]) -> anyhow::Result<AbtRoot> {
    let grammar = parse(source).map_err(anyhow::Error::msg)?;
    let parser = Parser::new(&grammar)?;
    Ok(parser.parse(data)?)
}
