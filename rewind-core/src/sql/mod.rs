//! SQL text handling: hint extraction, client-side commands and
//! statement classification.

pub mod command;
pub mod hints;
pub mod parser;

pub use command::{BatchControl, ClientCommand, Variable};
pub use hints::{extract_hints, HintedSql};
pub use parser::{ParsedStatement, StatementKind};
