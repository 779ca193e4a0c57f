use thiserror::Error;

/// Errors surfaced by the core crate (configuration loading, mostly).
///
/// The store and engine crates define their own error enums; this one
/// stays small on purpose.
#[derive(Debug, Error)]
pub enum HeraldError {
    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, HeraldError>;
