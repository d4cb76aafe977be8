//! Error type definitions for the LLM gateway
//!
//! This module defines all error types used throughout the application,
//! providing a hierarchical error system that makes debugging and error
//! handling more straightforward.

use thiserror::Error;

/// Top-level application error type
///
/// This enum represents all possible errors that can occur in the
/// application. It uses `thiserror` to provide automatic error trait
/// implementations and proper error chaining.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Dispatcher state-machine errors
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// Dialect translation errors
    #[error("Translator error: {0}")]
    Translator(#[from] TranslatorError),

    /// Metrics engine errors
    #[error("Metrics error: {0}")]
    Metrics(#[from] MetricsError),

    /// Config loading / channel registry errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Persistence errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Malformed client request
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl GatewayError {
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Dispatcher-level errors (spec.md §7 taxonomy: ConfigError / AllExhausted
/// surface through here; TransportError and RetryableUpstream are handled
/// internally by the retry loop and never escape as an `Err` — they become
/// either a further attempt or, once exhausted, `DispatchError::AllExhausted`).
#[derive(Error, Debug, Clone)]
pub enum DispatchError {
    /// No channel could be selected for the requested API type
    #[error("no channels available for api type {api_type}")]
    NoChannelsAvailable { api_type: String },

    /// A selected channel has no usable API keys configured
    #[error("no api keys configured for channel {channel}")]
    NoApiKeys { channel: String },

    /// Every channel/baseURL/key combination was tried and failed.
    /// Carries the last retryable upstream failure, if any, so the
    /// dispatcher can forward it verbatim per spec.md §4.5/§7.
    #[error("all channels exhausted: {status}")]
    AllExhausted {
        status: u16,
        body: String,
        had_retryable_failure: bool,
    },

    /// A terminal (non-retryable) upstream error — forwarded verbatim.
    #[error("terminal upstream error: {status}")]
    TerminalUpstream { status: u16, body: String },
}

impl DispatchError {
    pub fn no_channels<S: Into<String>>(api_type: S) -> Self {
        Self::NoChannelsAvailable {
            api_type: api_type.into(),
        }
    }

    pub fn no_api_keys<S: Into<String>>(channel: S) -> Self {
        Self::NoApiKeys {
            channel: channel.into(),
        }
    }

    /// Machine-readable cause code surfaced in the client-facing error body
    /// (spec.md §6: "Status 503 with codes NO_UPSTREAM / NO_API_KEYS /
    /// UNAVAILABLE"). `AllExhausted`/`TerminalUpstream` carrying a real
    /// upstream failure are forwarded verbatim instead of going through
    /// this code, so their variant here only covers the fallback case
    /// where no upstream attempt was ever made.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoChannelsAvailable { .. } => "NO_UPSTREAM",
            Self::NoApiKeys { .. } => "NO_API_KEYS",
            Self::AllExhausted { had_retryable_failure: false, .. } => "UNAVAILABLE",
            Self::AllExhausted { had_retryable_failure: true, .. } => "UPSTREAM_ERROR",
            Self::TerminalUpstream { .. } => "UPSTREAM_ERROR",
        }
    }
}

/// Dialect-translation-specific errors
#[derive(Error, Debug, Clone)]
pub enum TranslatorError {
    #[error("unsupported conversion from {from} to {to}")]
    UnsupportedDialect { from: String, to: String },

    #[error("malformed request body: {message}")]
    MalformedBody { message: String },

    #[error("missing required field: {field}")]
    MissingField { field: String },

    #[error("malformed upstream SSE event: {message}")]
    MalformedEvent { message: String },
}

impl TranslatorError {
    pub fn malformed_body<S: Into<String>>(message: S) -> Self {
        Self::MalformedBody {
            message: message.into(),
        }
    }

    pub fn missing_field<S: Into<String>>(field: S) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }
}

/// Metrics-engine-specific errors. Persistence failures are logged and
/// counted, never surfaced to the client (spec.md §7 propagation policy),
/// so this variant exists mainly for the persistence loop's own bookkeeping.
#[derive(Error, Debug, Clone)]
pub enum MetricsError {
    #[error("persistence buffer is in a drop state ({dropped} records dropped)")]
    BufferOverflow { dropped: u64 },

    #[error("persistence write failed after {attempts} attempts: {message}")]
    WriteFailed { attempts: u32, message: String },
}

/// Configuration / channel-registry errors
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("no channels configured")]
    NoChannelsConfigured,

    #[error("invalid channel '{name}': {message}")]
    InvalidChannel { name: String, message: String },

    #[error("failed to load config file: {message}")]
    LoadFailed { message: String },
}

impl ConfigError {
    pub fn invalid_channel<N: Into<String>, M: Into<String>>(name: N, message: M) -> Self {
        Self::InvalidChannel {
            name: name.into(),
            message: message.into(),
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
pub type DispatchResult<T> = Result<T, DispatchError>;
pub type TranslatorResult<T> = Result<T, TranslatorError>;
