// error.rs — Typed error taxonomy for the simulation engine
//
// One variant per error kind surfaced at the public boundary, so callers
// (calibration loops, ensembles, scenario runners) can pattern-match on the
// failure class. Variants carry the offending variable, population, and
// time where those are known.

use thiserror::Error;

/// Any failure raised while building or running a model.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The framework definition is internally inconsistent.
    #[error("framework error: {0}")]
    Framework(String),

    /// The parameter set does not line up with the framework.
    #[error("parameter set error: {0}")]
    ParameterSet(String),

    /// The initialization solver could not satisfy the databook targets.
    /// Callers routinely catch this one and retry with adjusted inputs,
    /// so the diagnostic trace is kept structured rather than flattened.
    #[error("bad initialization for population '{population}': {}", messages.join("; "))]
    BadInitialization {
        population: String,
        messages: Vec<String>,
    },

    /// A program set or its instructions are invalid.
    #[error("program error: {0}")]
    Program(String),

    /// A function expression referenced a name with no bound value.
    #[error("unbound identifier '{name}' in {context}")]
    UnboundIdentifier { name: String, context: String },

    /// A numeric guard tripped during integration.
    #[error("numeric error for '{variable}' in population '{population}' at t={time}: {message}")]
    Numeric {
        message: String,
        variable: String,
        population: String,
        time: f64,
    },

    /// A variable lookup failed.
    #[error("variable '{name}' not found in population '{population}'")]
    NotFound { name: String, population: String },

    /// The simulation settings are unusable (non-positive or non-finite dt,
    /// inverted time range).
    #[error("settings error: {0}")]
    Settings(String),

    /// A stored object could not be decoded.
    #[error("persistence error: {0}")]
    Persistence(String),
}

impl EngineError {
    /// Shorthand for a framework error with a formatted message.
    pub fn framework(msg: impl Into<String>) -> Self {
        EngineError::Framework(msg.into())
    }

    /// Shorthand for a parameter-set error with a formatted message.
    pub fn parset(msg: impl Into<String>) -> Self {
        EngineError::ParameterSet(msg.into())
    }

    /// Shorthand for a program error with a formatted message.
    pub fn program(msg: impl Into<String>) -> Self {
        EngineError::Program(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
