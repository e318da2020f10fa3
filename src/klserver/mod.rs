// 导出状态查询服务相关模块
pub mod web;

// 重新导出一些常用模块，方便使用
pub use web::{router, start_web_server, AppState};
