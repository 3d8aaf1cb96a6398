use thiserror::Error;

#[derive(Error, Debug)]
pub enum RunletError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    #[error("TOML parse error: {0}")]
    TomlParse(String),

    // Submission errors
    #[error(transparent)]
    Validation(#[from] ValidationError),

    // Sandbox errors
    #[error("Sandbox backend '{backend}' is not available: {reason}")]
    BackendNotAvailable { backend: String, reason: String },

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error("Failed to launch interpreter: {0}")]
    LaunchFailed(String),

    // Execution errors
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Generic wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RunletError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Provision(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// A submission rejected before any resource was allocated.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Code and language are required")]
    MissingField { field: &'static str },

    #[error("Unsupported language: {language}")]
    UnsupportedLanguage { language: String },

    #[error("Timeout must be between 1 and {max} seconds (got {value})")]
    Timeout { value: u64, max: u64 },

    #[error("Memory must be between 1 and {max} MB (got {value})")]
    Memory { value: u64, max: u64 },

    #[error("Code exceeds {max} bytes")]
    CodeTooLarge { max: usize },
}

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("Unsupported language: {language}")]
    Unsupported { language: String },

    #[error("Memory limit {requested} MB outside (0, {ceiling}] MB")]
    InvalidLimit { requested: u64, ceiling: u64 },

    #[error("Sandbox resources exhausted: {reason}")]
    ResourceExhausted { reason: String },

    #[error("Sandbox backend '{backend}' failed: {message}")]
    Backend { backend: String, message: String },

    #[error("IO error while provisioning: {0}")]
    Io(#[from] std::io::Error),
}

impl ProvisionError {
    /// Resource exhaustion is transient and must be retried by the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ResourceExhausted { .. })
    }

    /// Map an IO failure from allocating an isolation primitive.
    ///
    /// Host-side exhaustion (no space, no pids, fd tables full) is reported as
    /// `ResourceExhausted` so that the caller backs off instead of failing.
    pub fn from_alloc(what: &str, err: std::io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::ENOSPC) | Some(libc::EMFILE) | Some(libc::ENFILE)
            | Some(libc::ENOMEM) => Self::ResourceExhausted {
                reason: format!("{}: {}", what, err),
            },
            _ => Self::Io(err),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Execution not found: {id}")]
    NotFound { id: String },

    #[error("Invalid transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: &'static str,
        to: &'static str,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("Execution not found: {id}")]
    NotFound { id: String },
}

pub type Result<T> = std::result::Result<T, RunletError>;
