// 导出模块
pub mod klcommon;
pub mod kldata;
pub mod klserver;

// Re-export error types
pub use klcommon::error::AppError;
