//! MySQL Database Configuration
//!
//! .env 파일에서 데이터베이스 연결 정보를 읽어와 연결 풀을 생성합니다.

use crate::service::db::core::config::PoolConfig;
use crate::tool::error::DbError;
use dotenv::dotenv;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use std::env;
use std::path::PathBuf;
use tracing::{info, warn};

/// 데이터베이스 연결 설정 구조체
#[derive(Debug, Clone, PartialEq)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3306,
            user: "root".to_string(),
            password: String::new(),
            database: "users".to_string(),
        }
    }
}

impl DbConfig {
    /// 환경 변수에서 데이터베이스 설정을 읽습니다.
    ///
    /// 현재 디렉토리, 상위 디렉토리 순서로 .env 파일을 찾고,
    /// 환경 변수가 없으면 기본값을 사용합니다.
    pub fn from_env() -> Result<Self, DbError> {
        load_env_file();

        let defaults = Self::default();

        let host = env::var("db_host").unwrap_or_else(|_| {
            warn!("db_host 환경변수가 없어서 {}를 사용합니다.", defaults.host);
            defaults.host.clone()
        });

        let port = match env::var("db_port") {
            Ok(raw) => raw.parse::<u16>().map_err(|_| {
                DbError::Configuration(format!("db_port는 숫자여야 함: '{}'", raw))
            })?,
            Err(_) => {
                warn!("db_port 환경변수가 없어서 {}을 사용합니다.", defaults.port);
                defaults.port
            }
        };

        let user = env::var("db_id").unwrap_or_else(|_| {
            warn!("db_id 환경변수가 없어서 {}를 사용합니다.", defaults.user);
            defaults.user.clone()
        });

        let password = env::var("db_password").unwrap_or_else(|_| {
            warn!("db_password 환경변수가 없습니다.");
            String::new()
        });

        let database = env::var("db_name").unwrap_or_else(|_| {
            warn!("db_name 환경변수가 없어서 {}를 사용합니다.", defaults.database);
            defaults.database.clone()
        });

        Ok(Self {
            host,
            port,
            user,
            password,
            database,
        })
    }

    /// MySQL 연결 URL
    pub fn database_url(&self) -> String {
        format!(
            "mysql://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.database
        )
    }

    /// 연결 풀을 생성합니다.
    pub async fn connect(&self, pool_config: &PoolConfig) -> Result<MySqlPool, DbError> {
        info!(
            "데이터베이스 연결 시도: {}:{}@{}/{}",
            self.user, "***", self.host, self.database
        );

        let pool = MySqlPoolOptions::new()
            .min_connections(pool_config.min_connections)
            .max_connections(pool_config.max_connections)
            .acquire_timeout(pool_config.connect_timeout)
            .idle_timeout(pool_config.idle_timeout)
            .connect(&self.database_url())
            .await
            .map_err(|e| DbError::Connection(format!("pool creation failed: {}", e)))?;

        info!("MySQL 연결 풀 생성 완료: {}:{}", self.host, self.port);
        Ok(pool)
    }
}

/// .env 로드 - 현재 디렉토리, 상위 디렉토리 순서
fn load_env_file() {
    let current_dir = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let candidates = [
        Some(current_dir.join(".env")),
        current_dir.parent().map(|p| p.join(".env")),
    ];

    for path in candidates.into_iter().flatten() {
        if path.exists() {
            dotenv::from_path(&path).ok();
            info!("환경 파일 로드: {:?}", path);
            return;
        }
    }

    if dotenv().is_err() {
        warn!(".env 파일을 찾을 수 없어서 환경 변수를 직접 사용합니다.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_url() {
        let config = DbConfig {
            host: "db".into(),
            port: 3307,
            user: "app".into(),
            password: "secret".into(),
            database: "chat".into(),
        };
        assert_eq!(config.database_url(), "mysql://app:secret@db:3307/chat");
    }
}
