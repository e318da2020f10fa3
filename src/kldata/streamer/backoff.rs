use crate::klcommon::config::{BackoffKind, WebSocketConfig};
use std::time::Duration;

/// 重连退避策略
///
/// 只决定下一次等待多久，从不放弃重试。
pub trait BackoffPolicy: Send {
    /// 下一次重连前的等待时间
    fn next_delay(&mut self) -> Duration;

    /// 连接成功后重置
    fn reset(&mut self);
}

/// 固定间隔退避
#[derive(Debug, Clone)]
pub struct FixedBackoff {
    delay: Duration,
}

impl FixedBackoff {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for FixedBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl BackoffPolicy for FixedBackoff {
    fn next_delay(&mut self) -> Duration {
        self.delay
    }

    fn reset(&mut self) {}
}

/// 带上限的指数退避，每次失败间隔翻倍直到 `max`
#[derive(Debug, Clone)]
pub struct CappedExponentialBackoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl CappedExponentialBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Self { initial, max, current: initial }
    }
}

impl BackoffPolicy for CappedExponentialBackoff {
    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// 按配置创建退避策略
pub fn backoff_from_config(config: &WebSocketConfig) -> Box<dyn BackoffPolicy> {
    let initial = Duration::from_secs(config.reconnect_interval_secs);
    match config.backoff {
        BackoffKind::Fixed => Box::new(FixedBackoff::new(initial)),
        BackoffKind::Exponential => Box::new(CappedExponentialBackoff::new(
            initial,
            Duration::from_secs(config.max_reconnect_interval_secs),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_backoff_never_changes() {
        let mut backoff = FixedBackoff::default();
        for _ in 0..10 {
            assert_eq!(backoff.next_delay(), Duration::from_secs(5));
        }
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
    }

    #[test]
    fn test_exponential_backoff_caps_and_resets() {
        let mut backoff = CappedExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(10));
        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 10, 10]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_from_config() {
        let mut config = WebSocketConfig::default();
        let mut fixed = backoff_from_config(&config);
        assert_eq!(fixed.next_delay(), Duration::from_secs(5));
        assert_eq!(fixed.next_delay(), Duration::from_secs(5));

        config.backoff = BackoffKind::Exponential;
        config.max_reconnect_interval_secs = 8;
        let mut exp = backoff_from_config(&config);
        assert_eq!(exp.next_delay(), Duration::from_secs(5));
        assert_eq!(exp.next_delay(), Duration::from_secs(8));
    }
}
