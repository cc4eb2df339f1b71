pub mod logger;

use thiserror::Error;

/// 网关统一错误类型，每个变体对应一个类 HTTP 状态码
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Failed to define user access level")]
    AccessDenied,

    #[error("The user does not have sufficient access rights to perform the action")]
    InsufficientRole,

    #[error("Not enough tokens to perform the operation")]
    InsufficientTokens,

    #[error("The report belongs to another user")]
    NotOwner,

    #[error("Product not found: {0}")]
    ProductNotFound(String),

    #[error("The report doesn't exist")]
    ReportNotFound,

    #[error("User {0} not found")]
    UserNotFound(i64),

    #[error("Stage data is missing: {0}")]
    StageDataMissing(String),

    #[error("Such a report already exists")]
    DuplicateReport,

    #[error("User {0} already exists")]
    UserExists(i64),

    #[error("Bookmark {0} not found")]
    BookmarkNotFound(i64),

    #[error("You cannot delete someone else's bookmark")]
    ForeignBookmark,

    #[error("Product {0} is already bookmarked")]
    BookmarkExists(String),

    #[error("Invalid payload: {0}")]
    Validation(String),

    #[error("Error in CAS API: {0}")]
    Upstream(String),

    #[error("CAS API rejected the request: {0}")]
    UpstreamFailure(String),

    #[error("Timed out waiting for task {0}")]
    Timeout(String),

    #[error("Client disconnected")]
    Disconnected,

    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::AccessDenied
            | GatewayError::InsufficientRole
            | GatewayError::InsufficientTokens
            | GatewayError::NotOwner
            | GatewayError::ForeignBookmark => 403,
            GatewayError::ProductNotFound(_)
            | GatewayError::ReportNotFound
            | GatewayError::UserNotFound(_)
            | GatewayError::BookmarkNotFound(_)
            | GatewayError::StageDataMissing(_) => 404,
            GatewayError::DuplicateReport
            | GatewayError::UserExists(_)
            | GatewayError::BookmarkExists(_) => 409,
            GatewayError::Validation(_) => 422,
            GatewayError::Upstream(_) | GatewayError::UpstreamFailure(_) => 502,
            GatewayError::Timeout(_) => 504,
            GatewayError::Disconnected => 499,
            GatewayError::Database(_) | GatewayError::Internal(_) => 500,
        }
    }

    /// 对外暴露的消息，5xx 内部错误不泄露细节
    pub fn public_message(&self) -> String {
        match self {
            GatewayError::Database(_) | GatewayError::Internal(_) => {
                "Internal Server Error".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        GatewayError::Upstream(e.to_string())
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
