// 日志初始化：RUST_LOG 优先，其次使用配置中的 log_level。
use crate::config::ObservabilityConfig;

pub fn init_tracing(config: &ObservabilityConfig) {
    let default_level = config.log_level.trim();
    let default_level = if default_level.is_empty() {
        "info".to_string()
    } else {
        default_level.to_lowercase()
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    // 作为库被嵌入时宿主可能已安装订阅者，重复初始化直接忽略。
    tracing_subscriber::fmt().with_env_filter(filter).try_init().ok();
}
