use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("API error: {0}")]
    ApiError(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Data error: {0}")]
    DataError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("SQLite error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    #[error("URL parsing error: {0}")]
    UrlParseError(#[from] url::ParseError),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Backfill error: {0}")]
    BackfillError(String),

    #[error("Web server error: {0}")]
    WebServerError(String),
}

impl From<r2d2::Error> for AppError {
    fn from(e: r2d2::Error) -> Self {
        AppError::DatabaseError(format!("获取数据库连接失败: {}", e))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        AppError::WebSocketError(e.to_string())
    }
}

impl AppError {
    /// 获取错误类型的简洁摘要，作为日志中的 `error.summary` 字段
    ///
    /// 返回稳定的业务分类字符串，便于按类别聚合错误
    pub fn get_error_type_summary(&self) -> &'static str {
        match self {
            // 历史数据获取
            AppError::ApiError(_) => "kline_data_acquisition_failed",
            AppError::HttpError(_) => "market_data_connection_failed",
            AppError::BackfillError(_) => "historical_backfill_failed",

            // 数据解析与校验
            AppError::JsonError(_) => "market_data_parsing_failed",
            AppError::ParseError(_) => "market_data_format_invalid",
            AppError::DataError(_) => "market_data_validation_failed",

            // 持久化
            AppError::DatabaseError(_) => "market_data_persistence_failed",
            AppError::SqliteError(_) => "market_data_storage_operation_failed",

            // 实时连接
            AppError::WebSocketError(_) => "realtime_market_data_failed",
            AppError::UrlParseError(_) => "market_endpoint_invalid",

            AppError::IoError(_) => "collector_file_operation_failed",
            AppError::ConfigError(_) => "collector_configuration_invalid",
            AppError::WebServerError(_) => "status_api_server_failed",
        }
    }

    /// 检查错误是否为可重试类型
    pub fn is_retryable(&self) -> bool {
        match self {
            // 网络相关错误通常可重试
            AppError::HttpError(_) |
            AppError::ApiError(_) |
            AppError::BackfillError(_) |
            AppError::WebSocketError(_) |
            AppError::IoError(_) => true,

            // 锁争用、忙等属于临时性错误
            AppError::DatabaseError(msg) => {
                msg.contains("locked") || msg.contains("busy") || msg.contains("timeout")
            },
            AppError::SqliteError(e) => matches!(
                e.sqlite_error_code(),
                Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
            ),

            // 解析、校验、配置错误重试也不会成功
            AppError::JsonError(_) |
            AppError::ParseError(_) |
            AppError::DataError(_) |
            AppError::ConfigError(_) |
            AppError::UrlParseError(_) |
            AppError::WebServerError(_) => false,
        }
    }

    /// 是否属于持久化层错误（写入失败时不推进状态计数器）
    pub fn is_persistence(&self) -> bool {
        matches!(self, AppError::DatabaseError(_) | AppError::SqliteError(_))
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
