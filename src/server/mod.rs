//! HTTP / WebSocket 网关
//!
//! 流式操作走 `channels`，普通 JSON 请求走 `routes`，两者挂在同一个
//! `server.api_prefix` 之下。

pub mod channels;
pub mod routes;

use anyhow::Result;
use axum::{
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::auth::{self, SessionSigner};
use crate::cas::{CasApi, CasClient, PollPolicy};
use crate::config::AppConfig;
use crate::storage::models::User;
use crate::storage::Database;
use crate::utils::{GatewayError, GatewayResult};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub cas: Arc<dyn CasApi>,
    pub db: Database,
    pub signer: SessionSigner,
}

impl AppState {
    pub fn new(config: AppConfig, cas: Arc<dyn CasApi>, db: Database) -> Self {
        let signer = SessionSigner::from_config(&config.auth);
        Self {
            config: Arc::new(config),
            cas,
            db,
            signer,
        }
    }

    pub async fn caller(&self, headers: &HeaderMap) -> GatewayResult<Option<User>> {
        auth::resolve_caller(headers, &self.config.auth, &self.signer, &self.db).await
    }

    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy::from_config(&self.config.polling)
    }
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .merge(channels::router())
        .merge(routes::router());

    let prefix = state.config.server.api_prefix.trim_end_matches('/');
    let app = if prefix.is_empty() {
        api
    } else {
        Router::new().nest(prefix, api)
    };
    app.with_state(state)
}

pub async fn serve(config: AppConfig, db: Database) -> Result<()> {
    let cas = CasClient::from_config(&config)?;
    info!("CAS 地址: {}", config.cas_api_url());

    let addr = config.bind_address();
    let state = AppState::new(config, Arc::new(cas), db);
    let app = router(state);

    let listener = TcpListener::bind(&addr).await?;
    info!("网关已启动: http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("网关已停止");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("监听退出信号失败: {}", e);
        return;
    }
    info!("收到退出信号，正在关闭...");
}

/// 把 axum 提取器的拒绝统一成 422，由 `GatewayError` 负责输出
pub(crate) fn validated<T, E: std::fmt::Display>(extracted: Result<T, E>) -> GatewayResult<T> {
    extracted.map_err(|e| GatewayError::Validation(e.to_string()))
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!("请求失败 ({}): {}", status.as_u16(), self);
        } else {
            debug!("请求被拒绝 ({}): {}", status.as_u16(), self);
        }
        (status, Json(json!({ "message": self.public_message() }))).into_response()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_response_carries_status_and_hides_internals() {
        let response = GatewayError::InsufficientTokens.into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = GatewayError::Internal("secret detail".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let response = GatewayError::Validation("bad".into()).into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
