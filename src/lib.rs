pub mod config;
pub mod error;
pub mod expansion;
pub mod fetch;
pub mod lexer;
pub mod operator;
pub mod parser;
pub mod result_builder;
pub mod schema;
pub mod sql_compiler;
pub mod token;

pub use error::{QueryError, Result};
pub use expansion::{Expansion, SelectExpansion};
pub use sql_compiler::{Statement, StatementBuilder};
