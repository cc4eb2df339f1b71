//! 角色与 token 配额检查，包裹在具体操作之外

use std::future::Future;
use tracing::{debug, warn};

use crate::storage::models::{Role, User};
use crate::storage::Database;
use crate::utils::{GatewayError, GatewayResult};

/// 调用者未解析或被封禁时拒绝，否则比较访问级别
pub fn require_role(caller: Option<&User>, required: Role) -> GatewayResult<&User> {
    let user = caller.ok_or(GatewayError::AccessDenied)?;
    if !user.is_active {
        return Err(GatewayError::AccessDenied);
    }
    if required.access_level() > user.role.access_level() {
        return Err(GatewayError::InsufficientRole);
    }
    Ok(user)
}

/// manager 及以上不受 token 限制
pub fn check_tokens(user: &User, cost: i64) -> GatewayResult<()> {
    if user.role == Role::User && user.tokens < cost {
        return Err(GatewayError::InsufficientTokens);
    }
    Ok(())
}

fn is_billable(user: &User, cost: i64) -> bool {
    user.role == Role::User && cost > 0
}

#[derive(Debug, Clone, Copy)]
pub struct AccessGuard {
    required: Role,
    cost: i64,
}

impl AccessGuard {
    pub fn new(required: Role) -> Self {
        Self { required, cost: 0 }
    }

    pub fn with_cost(mut self, cost: i64) -> Self {
        self.cost = cost.max(0);
        self
    }

    pub fn admit<'u>(&self, caller: Option<&'u User>) -> GatewayResult<&'u User> {
        let user = require_role(caller, self.required)?;
        check_tokens(user, self.cost)?;
        Ok(user)
    }

    /// 先检查，再执行操作，操作成功后才扣 token
    pub async fn run<T, F>(&self, db: &Database, caller: Option<&User>, op: F) -> GatewayResult<T>
    where
        F: Future<Output = GatewayResult<T>>,
    {
        let user = self.admit(caller)?;
        let value = op.await?;

        if is_billable(user, self.cost) {
            if let Err(e) = db.debit_tokens(user.id, self.cost).await {
                warn!(user_id = user.id, cost = self.cost, "扣除 token 失败: {}", e);
                return Err(e);
            }
            debug!(user_id = user.id, cost = self.cost, "已扣除 token");
        }
        Ok(value)
    }
}
