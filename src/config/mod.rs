use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "config/settings.toml";

/// 环境变量前缀，例如 CASGW__CAS__API_KEY
const ENV_PREFIX: &str = "CASGW";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub cas: CasConfig,
    pub auth: AuthConfig,
    pub polling: PollingConfig,
    pub costs: CostConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub api_prefix: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CasConfig {
    pub server_host: String,
    pub version_path: String,
    pub api_key: String,
    pub request_timeout_secs: u64,
    pub search_max_items: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    pub web_service_api_key: String,
    pub session_secret: String,
    pub session_ttl_minutes: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PollingConfig {
    pub interval_secs: u64,
    /// 0 表示不设上限
    pub deadline_secs: u64,
}

/// 各操作消耗的 token 数
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CostConfig {
    pub search: i64,
    pub task_result: i64,
    pub pipeline: i64,
    pub save_report: i64,
    pub visualize: i64,
    pub collect: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    pub database_path: String,
    pub default_user_tokens: i64,
}

impl AppConfig {
    /// 默认值 → 配置文件（可选）→ 环境变量
    pub fn load(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::Config::try_from(&Self::default())?)
            .add_source(::config::File::with_name(path).required(false))
            .add_source(::config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        // 间隔为 0 时轮询会变成对 CAS 的忙循环
        anyhow::ensure!(
            self.polling.interval_secs > 0,
            "polling.interval_secs 必须大于 0"
        );
        Ok(())
    }

    pub fn save(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn cas_api_url(&self) -> String {
        format!("{}{}", self.cas.server_host, self.cas.version_path)
    }

    pub fn database_url(&self) -> String {
        format!("sqlite:{}", self.storage.database_path)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn deadline(&self) -> Option<Duration> {
        (self.deadline_secs > 0).then(|| Duration::from_secs(self.deadline_secs))
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8088,
                api_prefix: "/api/v1".to_string(),
            },
            cas: CasConfig {
                server_host: "http://127.0.0.1:8000".to_string(),
                version_path: "/api/v1/".to_string(),
                api_key: "your-cas-api-key".to_string(),
                request_timeout_secs: 30,
                search_max_items: 5,
            },
            auth: AuthConfig {
                web_service_api_key: "your-web-service-api-key".to_string(),
                session_secret: "change-me".to_string(),
                session_ttl_minutes: 60 * 24,
            },
            polling: PollingConfig {
                interval_secs: 3,
                deadline_secs: 600,
            },
            costs: CostConfig {
                search: 1,
                task_result: 0,
                pipeline: 3,
                save_report: 0,
                visualize: 1,
                collect: 0,
            },
            storage: StorageConfig {
                database_path: "./data/gateway.db".to_string(),
                default_user_tokens: 10,
            },
        }
    }
}
