//! 日志初始化。
//!
//! 运行时内部只使用 `log` 宏；嵌入方可以接入任何实现，
//! 这里提供基于 `env_logger` 的默认配置。

use log::LevelFilter;

/// 以固定级别初始化日志。已经初始化过时什么也不做，返回 `false`。
pub fn init(level: LevelFilter) -> bool {
    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp_millis()
        .try_init()
        .is_ok()
}

/// 按 `RUST_LOG` 初始化，未设置时默认 `warn`。
pub fn init_from_env() -> bool {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_a_noop() {
        init(LevelFilter::Debug);
        assert!(!init(LevelFilter::Trace));
        assert!(!init_from_env());
    }
}
