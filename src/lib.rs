//! # MBASIC
//!
//! Microsoft BASIC-80 v5.21 as a library.
//! ```text
//! MBASIC
//! Ok
//! █
//! ```
//!
//! The `lang` module turns source text into an AST.
//! The `mach` module executes the AST one statement per tick.

#[macro_use]
pub mod lang;
pub mod mach;
