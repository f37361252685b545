use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VellumErrorCode {
    Io,
    InvalidConfig,
    QueueFull,
    ShuttingDown,
    Cancelled,
    Handler,
    HandlerPanicked,
}

impl VellumErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            VellumErrorCode::Io => "io",
            VellumErrorCode::InvalidConfig => "invalid_config",
            VellumErrorCode::QueueFull => "queue_full",
            VellumErrorCode::ShuttingDown => "shutting_down",
            VellumErrorCode::Cancelled => "cancelled",
            VellumErrorCode::Handler => "handler",
            VellumErrorCode::HandlerPanicked => "handler_panicked",
        }
    }
}

#[derive(Debug, Error)]
pub enum VellumError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
    #[error("job queue full")]
    QueueFull,
    #[error("dispatcher shutting down")]
    ShuttingDown,
    #[error("job cancelled")]
    Cancelled,
    #[error("handler error: {0}")]
    Handler(String),
    #[error("handler panicked")]
    HandlerPanicked,
}

impl VellumError {
    pub fn code(&self) -> VellumErrorCode {
        match self {
            VellumError::Io(_) => VellumErrorCode::Io,
            VellumError::InvalidConfig { .. } => VellumErrorCode::InvalidConfig,
            VellumError::QueueFull => VellumErrorCode::QueueFull,
            VellumError::ShuttingDown => VellumErrorCode::ShuttingDown,
            VellumError::Cancelled => VellumErrorCode::Cancelled,
            VellumError::Handler(_) => VellumErrorCode::Handler,
            VellumError::HandlerPanicked => VellumErrorCode::HandlerPanicked,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }
}
