/*!
## Language Module

Lexical analysis and parsing of BASIC-80 source text.

*/

pub type LineNumber = u16;

/// Largest line number a program may use.
pub const MAX_LINE_NUMBER: LineNumber = 65529;

#[macro_use]
pub mod error;
pub mod ast;
mod lex;
mod parse;
pub mod token;

pub use error::{Error, ErrorCode};
pub use lex::lex;
pub use parse::parse;
