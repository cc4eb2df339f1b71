//! 调用者身份解析：静态 API key + Telegram 用户 id，或签名会话 cookie

use axum::http::{header::COOKIE, HeaderMap};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, warn};

use crate::config::AuthConfig;
use crate::storage::models::User;
use crate::storage::Database;
use crate::utils::GatewayResult;

pub use crate::cas::client::API_KEY_HEADER;

pub const TELEGRAM_USER_HEADER: &str = "Telegram-User-Id";
pub const SESSION_COOKIE: &str = "api-token";

type HmacSha256 = Hmac<Sha256>;

/// 会话 token 格式: `<user_id>.<expires_unix>.<base64url(hmac)>`
#[derive(Clone)]
pub struct SessionSigner {
    secret: Vec<u8>,
    ttl: Duration,
}

impl SessionSigner {
    pub fn new(secret: &str, ttl_minutes: i64) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
            ttl: Duration::minutes(ttl_minutes),
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(&config.session_secret, config.session_ttl_minutes)
    }

    fn mac(&self, payload: &str) -> HmacSha256 {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key length");
        mac.update(payload.as_bytes());
        mac
    }

    pub fn issue(&self, user_id: i64) -> String {
        self.issue_at(user_id, Utc::now())
    }

    fn issue_at(&self, user_id: i64, now: DateTime<Utc>) -> String {
        let payload = format!("{}.{}", user_id, (now + self.ttl).timestamp());
        let tag = URL_SAFE_NO_PAD.encode(self.mac(&payload).finalize().into_bytes());
        format!("{}.{}", payload, tag)
    }

    pub fn verify(&self, token: &str) -> Option<i64> {
        self.verify_at(token, Utc::now())
    }

    fn verify_at(&self, token: &str, now: DateTime<Utc>) -> Option<i64> {
        let (payload, tag) = token.rsplit_once('.')?;
        let (user_id, expires) = payload.split_once('.')?;

        let tag = URL_SAFE_NO_PAD.decode(tag).ok()?;
        self.mac(payload).verify_slice(&tag).ok()?;

        let expires: i64 = expires.parse().ok()?;
        if expires <= now.timestamp() {
            debug!("会话已过期: user_id={}", user_id);
            return None;
        }
        user_id.parse().ok()
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

pub fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}

/// 无法解析出已注册用户时返回 None，由访问检查转换为 AccessDenied
pub async fn resolve_caller(
    headers: &HeaderMap,
    config: &AuthConfig,
    signer: &SessionSigner,
    db: &Database,
) -> GatewayResult<Option<User>> {
    let api_key_ok = header_str(headers, API_KEY_HEADER) == Some(config.web_service_api_key.as_str());

    let user_id = if api_key_ok {
        match header_str(headers, TELEGRAM_USER_HEADER).and_then(|v| v.trim().parse::<i64>().ok()) {
            Some(id) => id,
            None => {
                warn!("API key 正确但缺少 {} 头", TELEGRAM_USER_HEADER);
                return Ok(None);
            }
        }
    } else if let Some(token) = cookie_value(headers, SESSION_COOKIE) {
        match signer.verify(token) {
            Some(id) => id,
            None => {
                debug!("会话 token 校验失败");
                return Ok(None);
            }
        }
    } else {
        return Ok(None);
    };

    let user = db.get_user(user_id).await?;
    if user.is_none() {
        debug!("Telegram 用户尚未注册: {}", user_id);
    }
    Ok(user)
}
