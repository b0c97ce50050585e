//! Error taxonomy of the query engine.
//!
//! Every failure is synchronous and local. `code()` gives the stable
//! identity that an outer layer maps to a client-facing status.

use crate::lexer::ParseError;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum QueryError {
    #[error(transparent)]
    Syntax(#[from] ParseError),

    #[error("key '{target_name}' does not exist within {}", .scope.join(", "))]
    UnknownField {
        target_name: String,
        scope: Vec<String>,
    },

    #[error("entity definition '{name}' not found")]
    UnknownDefinition { name: String },

    #[error("operator '{operator}' not allowed for '{alias}' with a {type_class} value")]
    UnknownOperator {
        alias: String,
        operator: String,
        type_class: String,
    },

    #[error("operator '{operator}' rejected the {type_class} value of '{alias}'")]
    OperatorShape {
        alias: String,
        operator: String,
        type_class: String,
    },

    #[error("'{alias}' is filtered with incompatible values: {first} and {second}")]
    TypeConflict {
        alias: String,
        first: String,
        second: String,
    },

    #[error("invalid operator template '{template}': {message}")]
    Template { template: String, message: String },

    #[error("parameter '{name}' is already bound to a different value")]
    ParameterConflict { name: String },

    #[error("method '{method}' is not allowed for the edge representation")]
    EdgeRepresentation { method: String },

    #[error("method '{method}' is not allowed for the node representation")]
    NodeRepresentation { method: String },

    #[error("response exceeds the allowed size of {limit_mb} MB")]
    ResponseTooLarge { limit_mb: usize },

    #[error("configuration error: {0}")]
    Config(String),
}

impl QueryError {
    pub fn code(&self) -> &'static str {
        match self {
            QueryError::Syntax(_) => "SYNTAX_ERROR",
            QueryError::UnknownField { .. } => "KEY_NOT_INSIDE_DEFLIST",
            QueryError::UnknownDefinition { .. } => "DEFLIST_NOT_FOUND",
            QueryError::UnknownOperator { .. } => "OP_NOT_ALLOWED",
            QueryError::OperatorShape { .. } => "OP_SHAPE_INVALID",
            QueryError::TypeConflict { .. } => "WHERE_WRONG_DATA_TYPE",
            QueryError::Template { .. } => "TEMPLATE_INVALID",
            QueryError::ParameterConflict { .. } => "PARAM_CONFLICT",
            QueryError::EdgeRepresentation { .. } => "METHOD_NOT_ALLOWED_FOR_EDGE_REPR",
            QueryError::NodeRepresentation { .. } => "METHOD_NOT_ALLOWED_FOR_NODE_REPR",
            QueryError::ResponseTooLarge { .. } => "RESPONSE_SIZE_EXCEEDED",
            QueryError::Config(_) => "CONFIG_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, QueryError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_filter;

    #[test]
    fn test_codes_and_messages() {
        let err: QueryError = parse_filter("a.eq.1)").unwrap_err().into();
        assert_eq!(err.code(), "SYNTAX_ERROR");
        assert!(err.to_string().contains("position 6"));

        let err = QueryError::UnknownField {
            target_name: "x".to_string(),
            scope: vec!["A".to_string(), "C".to_string()],
        };
        assert_eq!(err.code(), "KEY_NOT_INSIDE_DEFLIST");
        assert_eq!(err.to_string(), "key 'x' does not exist within A, C");

        let err = QueryError::Config("missing entry point".to_string());
        assert_eq!(err.code(), "CONFIG_ERROR");

        let err = QueryError::EdgeRepresentation {
            method: "fetch_stations".to_string(),
        };
        assert_eq!(err.code(), "METHOD_NOT_ALLOWED_FOR_EDGE_REPR");
        assert_eq!(
            err.to_string(),
            "method 'fetch_stations' is not allowed for the edge representation"
        );
    }
}
