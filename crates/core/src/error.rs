use thiserror::Error;

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("unknown resource {0}")]
    UnknownResourceKind(String),
    #[error("marshal: {0}")]
    Marshal(#[from] serde_json::Error),
    #[error("checksum mismatch: {expected} != {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("apply patch: {0}")]
    PatchApply(String),
    #[error("patch strategy not enabled for resource {0}")]
    StrategyNotEnabled(String),
    #[error("upstream api error{}: {message}", fmt_code(.code))]
    UpstreamApi { code: Option<u16>, message: String },
    #[error("permanent: {0}")]
    Permanent(String),
    #[error("send {op}: {message}")]
    Callback { op: &'static str, message: String },
    #[error("watch: {0}")]
    Watch(String),
    #[error("cancelled")]
    Cancelled,
    #[error("config: {0}")]
    Config(String),
}

impl SyncError {
    pub fn upstream(code: Option<u16>, message: impl Into<String>) -> Self {
        SyncError::UpstreamApi { code, message: message.into() }
    }

    pub fn callback(op: &'static str, err: anyhow::Error) -> Self {
        SyncError::Callback { op, message: format!("{:#}", err) }
    }

    pub fn code(&self) -> Option<u16> {
        match self {
            SyncError::UpstreamApi { code, .. } => *code,
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool { self.code() == Some(404) }

    pub fn is_already_exists(&self) -> bool { self.code() == Some(409) }

    /// Errors that retrying cannot fix. Upstream 4xx are permanent except timeouts and throttling.
    pub fn is_permanent(&self) -> bool {
        match self {
            SyncError::UpstreamApi { code: Some(c), .. } => (400..500).contains(c) && *c != 408 && *c != 429,
            SyncError::UpstreamApi { code: None, .. } | SyncError::Watch(_) | SyncError::Callback { .. } => false,
            _ => true,
        }
    }
}

fn fmt_code(code: &Option<u16>) -> String {
    code.map(|c| format!(" ({})", c)).unwrap_or_default()
}

/// A failed inbound patch/verify, carrying the object that was read as the base
/// so the caller can hand it to the remote side for resynchronization.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct Diverged {
    pub base_object: Option<Vec<u8>>,
    pub source: SyncError,
}

impl Diverged {
    pub fn new(base_object: Option<Vec<u8>>, source: SyncError) -> Self {
        Self { base_object, source }
    }
}

impl From<SyncError> for Diverged {
    fn from(source: SyncError) -> Self {
        Self { base_object: None, source }
    }
}
