//! Unified error type for the schema inference, schema store and planner
//! subsystems (spec §7), shaped after the teacher's `engine/error.rs`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Serialize, Deserialize)]
pub enum EngineError {
    #[error("Connection failed: {message}")]
    ConnectionError { message: String },

    #[error("Authentication failed: {message}")]
    AuthenticationError { message: String },

    #[error("Schema security error: {message}")]
    SchemaSecurity { message: String },

    #[error("Schema not found: {name}@{version}")]
    SchemaNotFound { name: String, version: u32 },

    #[error("Schema write failed: {message}")]
    SchemaWriteFailed {
        message: String,
        first_column: Option<String>,
        second_column: Option<String>,
    },

    #[error("Invalid connection properties: {message}")]
    InvalidConnectionProperties { message: String },

    #[error("Feature not supported: {message}")]
    UnsupportedFeature { message: String },

    #[error("Query compile error: {message}")]
    QueryCompileError { message: String },

    #[error("Query cancelled")]
    QueryCancelled,

    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Transient error: {message}")]
    Transient { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl EngineError {
    pub fn connection_error(message: impl Into<String>) -> Self {
        EngineError::ConnectionError { message: message.into() }
    }

    pub fn authentication_error(message: impl Into<String>) -> Self {
        EngineError::AuthenticationError { message: message.into() }
    }

    pub fn schema_security(message: impl Into<String>) -> Self {
        EngineError::SchemaSecurity { message: message.into() }
    }

    pub fn schema_not_found(name: impl Into<String>, version: u32) -> Self {
        EngineError::SchemaNotFound { name: name.into(), version }
    }

    pub fn schema_write_failed(message: impl Into<String>) -> Self {
        EngineError::SchemaWriteFailed {
            message: message.into(),
            first_column: None,
            second_column: None,
        }
    }

    pub fn duplicate_column(first: impl Into<String>, second: impl Into<String>) -> Self {
        EngineError::SchemaWriteFailed {
            message: "duplicate column key on import".to_string(),
            first_column: Some(first.into()),
            second_column: Some(second.into()),
        }
    }

    pub fn invalid_connection_properties(message: impl Into<String>) -> Self {
        EngineError::InvalidConnectionProperties { message: message.into() }
    }

    pub fn unsupported_feature(message: impl Into<String>) -> Self {
        EngineError::UnsupportedFeature { message: message.into() }
    }

    pub fn query_compile_error(message: impl Into<String>) -> Self {
        EngineError::QueryCompileError { message: message.into() }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        EngineError::Internal { message: message.into() }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        EngineError::Transient { message: message.into() }
    }

    /// Classify a raw driver error message/code the way
    /// `MongoDriver::create_client_and_ping` classifies authentication
    /// failures: authorization-shaped errors become `SchemaSecurity` and are
    /// never retried.
    pub fn classify_store_error(message: &str, code: Option<i32>) -> Self {
        const AUTH_CODES: [i32; 2] = [13, 18];
        let looks_like_auth = matches!(code, Some(c) if AUTH_CODES.contains(&c))
            || message.contains("Authentication failed")
            || message.contains("not authorized");
        if looks_like_auth {
            EngineError::schema_security(message.to_string())
        } else {
            EngineError::connection_error(message.to_string())
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
