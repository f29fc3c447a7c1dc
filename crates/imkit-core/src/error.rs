use std::fmt;
use std::time::Duration;

/// Closed set of failure kinds every remote-backed operation maps onto.
///
/// The numeric values are the codes the messaging backend puts on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    CloseNormal,
    CloseAbnormal,
    AppNotAvailable,
    InvalidLogin,
    SessionRequired,
    ReadTimeout,
    LoginTimeout,
    FrameTooLong,
    InvalidOrigin,
    SessionConflict,
    SessionTokenExpired,
    InternalError,
    SendMessageTimeout,
    ConversationSignatureFailed,
    ConversationNotFound,
    ConversationFull,
    ConversationRejectedByApp,
    ConversationUpdateFailed,
    ConversationReadOnly,
    ConversationNotAllowed,
    InvalidMessagingTarget,
    MessageRejectedByApp,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 22] = [
        Self::CloseNormal,
        Self::CloseAbnormal,
        Self::AppNotAvailable,
        Self::InvalidLogin,
        Self::SessionRequired,
        Self::ReadTimeout,
        Self::LoginTimeout,
        Self::FrameTooLong,
        Self::InvalidOrigin,
        Self::SessionConflict,
        Self::SessionTokenExpired,
        Self::InternalError,
        Self::SendMessageTimeout,
        Self::ConversationSignatureFailed,
        Self::ConversationNotFound,
        Self::ConversationFull,
        Self::ConversationRejectedByApp,
        Self::ConversationUpdateFailed,
        Self::ConversationReadOnly,
        Self::ConversationNotAllowed,
        Self::InvalidMessagingTarget,
        Self::MessageRejectedByApp,
    ];

    /// Numeric protocol value.
    pub fn as_u16(self) -> u16 {
        match self {
            Self::CloseNormal => 1000,
            Self::CloseAbnormal => 1006,
            Self::AppNotAvailable => 4100,
            Self::InvalidLogin => 4103,
            Self::SessionRequired => 4105,
            Self::ReadTimeout => 4107,
            Self::LoginTimeout => 4108,
            Self::FrameTooLong => 4109,
            Self::InvalidOrigin => 4110,
            Self::SessionConflict => 4111,
            Self::SessionTokenExpired => 4112,
            Self::InternalError => 4200,
            Self::SendMessageTimeout => 4201,
            Self::ConversationSignatureFailed => 4302,
            Self::ConversationNotFound => 4303,
            Self::ConversationFull => 4304,
            Self::ConversationRejectedByApp => 4305,
            Self::ConversationUpdateFailed => 4306,
            Self::ConversationReadOnly => 4307,
            Self::ConversationNotAllowed => 4308,
            Self::InvalidMessagingTarget => 4401,
            Self::MessageRejectedByApp => 4402,
        }
    }

    /// Look up a code by its numeric value.
    pub fn from_u16(value: u16) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.as_u16() == value)
    }

    /// Map a server-supplied code, folding unknown values into `InternalError`.
    pub fn from_server(value: u64) -> Self {
        u16::try_from(value)
            .ok()
            .and_then(Self::from_u16)
            .unwrap_or(Self::InternalError)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::CloseNormal => "CLOSE_NORMAL",
            Self::CloseAbnormal => "CLOSE_ABNORMAL",
            Self::AppNotAvailable => "APP_NOT_AVAILABLE",
            Self::InvalidLogin => "INVALID_LOGIN",
            Self::SessionRequired => "SESSION_REQUIRED",
            Self::ReadTimeout => "READ_TIMEOUT",
            Self::LoginTimeout => "LOGIN_TIMEOUT",
            Self::FrameTooLong => "FRAME_TOO_LONG",
            Self::InvalidOrigin => "INVALID_ORIGIN",
            Self::SessionConflict => "SESSION_CONFLICT",
            Self::SessionTokenExpired => "SESSION_TOKEN_EXPIRED",
            Self::InternalError => "INTERNAL_ERROR",
            Self::SendMessageTimeout => "SEND_MESSAGE_TIMEOUT",
            Self::ConversationSignatureFailed => "CONVERSATION_SIGNATURE_FAILED",
            Self::ConversationNotFound => "CONVERSATION_NOT_FOUND",
            Self::ConversationFull => "CONVERSATION_FULL",
            Self::ConversationRejectedByApp => "CONVERSATION_REJECTED_BY_APP",
            Self::ConversationUpdateFailed => "CONVERSATION_UPDATE_FAILED",
            Self::ConversationReadOnly => "CONVERSATION_READ_ONLY",
            Self::ConversationNotAllowed => "CONVERSATION_NOT_ALLOWED",
            Self::InvalidMessagingTarget => "INVALID_MESSAGING_TARGET",
            Self::MessageRejectedByApp => "MESSAGE_REJECTED_BY_APP",
        }
    }

    /// Codes after which the session must not be re-opened automatically.
    pub fn is_fatal_to_session(self) -> bool {
        matches!(
            self,
            Self::SessionConflict
                | Self::InvalidLogin
                | Self::SessionTokenExpired
                | Self::AppNotAvailable
                | Self::InvalidOrigin
        )
    }

    /// Codes describing the connection itself rather than a single operation.
    pub fn is_connection_fault(self) -> bool {
        matches!(
            self,
            Self::CloseNormal
                | Self::CloseAbnormal
                | Self::ReadTimeout
                | Self::LoginTimeout
                | Self::FrameTooLong
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// All errors surfaced by imkit.
#[derive(Debug, thiserror::Error)]
pub enum ImError {
    /// A failure reported by, or attributed to, the remote side.
    #[error("{code} ({}): {}", .code.as_u16(), .detail.as_deref().unwrap_or("no detail"))]
    Code {
        code: ErrorCode,
        detail: Option<String>,
    },

    /// Local validation failed before any remote call was issued.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid message state: expected {expected}, actual {actual}")]
    InvalidMessageState {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),
}

impl ImError {
    pub fn code(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self::Code {
            code,
            detail: Some(detail.into()),
        }
    }

    pub fn bare(code: ErrorCode) -> Self {
        Self::Code { code, detail: None }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// The taxonomy kind of this error, if it came from the remote side or the
    /// connection. Local validation failures have none.
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            Self::Code { code, .. } => Some(*code),
            Self::Timeout(_) => Some(ErrorCode::ReadTimeout),
            Self::WebSocket(_) => Some(ErrorCode::CloseAbnormal),
            _ => None,
        }
    }

    /// Whether this error carries the given code.
    pub fn is(&self, code: ErrorCode) -> bool {
        self.error_code() == Some(code)
    }
}

/// Result alias using ImError.
pub type ImResult<T> = Result<T, ImError>;
