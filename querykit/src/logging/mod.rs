//! 로깅 초기화
//!
//! Installs a `tracing_subscriber` fmt subscriber. `RUST_LOG` wins over the
//! default level passed in.

use anyhow::Result;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber.
///
/// Calling this more than once is harmless: later calls leave the first
/// subscriber in place and return `Ok(false)`.
pub fn init_logging(default_level: &str) -> Result<bool> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| {
        EnvFilter::try_new(default_level)
            .map_err(|e| anyhow::anyhow!("로깅 설정 파싱 실패: {e}"))
    })?;

    Ok(fmt().with_env_filter(filter).with_target(false).try_init().is_ok())
}
