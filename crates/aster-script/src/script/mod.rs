//! Script Engine
//!
//! Lexer, parser and async evaluator for the JavaScript subset scripts are
//! written in.

pub mod ast;
pub(crate) mod builtins;
mod error;
pub(crate) mod heap;
pub(crate) mod interpreter;
pub(crate) mod lexer;
mod parser;
pub mod scope;
pub mod value;

pub use error::SyntaxError;
pub use parser::parse;
pub use value::Value;
