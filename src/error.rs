use thiserror::Error;

/// Unified error type for the Giro egress manager
#[derive(Error, Debug)]
pub enum GiroError {
    // Configuration errors
    #[error("Duplicate circuit: {identifier}")]
    DuplicateCircuit { identifier: String },

    #[error("A circuit outside the cycling pool must have a name")]
    UnnamedRigidCircuit,

    #[error("Unknown action: {name}")]
    UnknownAction { name: String },

    #[error("No circuit found for {spec}")]
    NoCircuitFound { spec: String },

    #[error("Operation not supported on a rigid circuit")]
    RigidCircuitMisuse,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Resource exhaustion
    #[error("All cycling circuits are unhealthy")]
    AllCircuitsUnhealthy,

    #[error("Exit IP did not change after {attempts} attempts")]
    IpChangeExhausted { attempts: u32 },

    // IP change bookkeeping
    #[error("No exit IP observed for circuit {identifier}")]
    MissingIp { identifier: String },

    // Probing
    #[error("Exit IP probe failed: {0}")]
    ProbeFailed(String),

    // Daemon I/O
    #[error("Daemon error: {0}")]
    Daemon(String),

    // Persistence
    #[error("Persistence error: {0}")]
    Persistence(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for Giro operations
pub type Result<T> = std::result::Result<T, GiroError>;

impl GiroError {
    /// Programmer/configuration errors: misusing the API or a bad definition
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            GiroError::DuplicateCircuit { .. }
                | GiroError::UnnamedRigidCircuit
                | GiroError::UnknownAction { .. }
                | GiroError::NoCircuitFound { .. }
                | GiroError::RigidCircuitMisuse
                | GiroError::InvalidConfig(_)
        )
    }

    /// The pool cannot make forward progress
    pub fn is_exhaustion(&self) -> bool {
        matches!(
            self,
            GiroError::AllCircuitsUnhealthy | GiroError::IpChangeExhausted { .. }
        )
    }

    /// Errors that should terminate the process unless the operator
    /// installed an override
    pub fn is_fatal(&self) -> bool {
        self.is_configuration() || self.is_exhaustion() || matches!(self, GiroError::Daemon(_))
    }
}
