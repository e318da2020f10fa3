// 导出数据采集相关模块
pub mod backfill;
pub mod status;
pub mod streamer;
pub mod supervisor;

// 重新导出常用模块，方便使用
pub use backfill::HistoricalBackfiller;
pub use status::{StatusTracker, StatusView};
pub use streamer::{ConnectionState, StreamStats, StreamSubscriber};
pub use supervisor::{CollectorHandle, Supervisor};
