/// 代理配置模块
///
/// REST请求与WebSocket连接共用同一个SOCKS5代理设置
use serde::{Deserialize, Serialize};

/// 默认代理服务器地址
pub const PROXY_HOST: &str = "127.0.0.1";

/// 默认代理服务器端口
pub const PROXY_PORT: u16 = 1080;

/// 代理配置结构体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// 是否使用代理
    pub enabled: bool,
    /// 代理服务器地址
    pub host: String,
    /// 代理服务器端口
    pub port: u16,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: PROXY_HOST.to_string(),
            port: PROXY_PORT,
        }
    }
}

impl ProxyConfig {
    /// 获取完整的代理URL，供 reqwest 使用
    pub fn url(&self) -> String {
        format!("socks5://{}:{}", self.host, self.port)
    }
}
