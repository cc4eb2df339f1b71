use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        Path, State,
    },
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tracing::info;

use super::{validated, AppState};
use crate::access::require_role;
use crate::storage::models::{
    ActivityLog, AnalysisReport, Bookmark, HistoryEntry, NewBookmark, NewHistoryEntry,
    NewUserStats, ReportSummary, Role, User, UserPatch,
};
use crate::utils::{GatewayError, GatewayResult};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/users/me", get(me))
        .route("/users/accept_terms", post(accept_terms))
        .route(
            "/users/:user_id",
            get(user_info).put(update_user).delete(delete_user),
        )
        .route("/reports", get(list_reports))
        .route("/reports/:id", get(report_info))
        .route("/bookmarks", get(list_bookmarks).post(add_bookmark))
        .route("/bookmarks/:id", get(bookmark_info).delete(remove_bookmark))
        .route(
            "/history",
            get(list_history).post(add_history).delete(clear_history),
        )
        .route("/admin/stats", get(user_stats))
        .route("/admin/activity", get(all_activity))
        .route("/admin/activity/:user_id", get(user_activity))
        .route("/admin/users/:user_id/tokens", post(credit_tokens))
        .route("/admin/users/:user_id/role", post(change_role))
        .route("/admin/users/:user_id/ban", post(ban_user))
        .route("/admin/users/:user_id/unban", post(unban_user))
}

#[derive(Debug, Deserialize)]
pub struct TokensRequest {
    pub amount: i64,
}

#[derive(Debug, Deserialize)]
pub struct RoleRequest {
    pub role: Role,
}

type JsonBody<T> = Result<Json<T>, JsonRejection>;
type IdPath = Result<Path<i64>, PathRejection>;

async fn authorize(state: &AppState, headers: &HeaderMap, required: Role) -> GatewayResult<User> {
    let caller = state.caller(headers).await?;
    require_role(caller.as_ref(), required).cloned()
}

async fn me(State(state): State<AppState>, headers: HeaderMap) -> GatewayResult<Json<User>> {
    let user = authorize(&state, &headers, Role::User).await?;
    Ok(Json(user))
}

async fn accept_terms(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> GatewayResult<Json<User>> {
    let user = authorize(&state, &headers, Role::User).await?;
    let updated = state.db.accept_terms(user.id).await?;
    state
        .db
        .log_action(Some(user.id), user.id, "Accepted terms of use")
        .await?;
    Ok(Json(updated))
}

// ---- 用户管理 ----

async fn user_info(
    State(state): State<AppState>,
    headers: HeaderMap,
    user_id: IdPath,
) -> GatewayResult<Json<User>> {
    authorize(&state, &headers, Role::Manager).await?;
    let Path(user_id) = validated(user_id)?;
    let user = state
        .db
        .get_user(user_id)
        .await?
        .ok_or(GatewayError::UserNotFound(user_id))?;
    Ok(Json(user))
}

async fn update_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    user_id: IdPath,
    patch: JsonBody<UserPatch>,
) -> GatewayResult<Json<User>> {
    let manager = authorize(&state, &headers, Role::Manager).await?;
    let Path(user_id) = validated(user_id)?;
    let Json(patch) = validated(patch)?;
    if patch.is_empty() {
        return Err(GatewayError::Validation("nothing to update".to_string()));
    }
    // 角色变更仍然只有 admin 可以做
    if patch.role.is_some() {
        require_role(Some(&manager), Role::Admin)?;
    }

    let user = state.db.patch_user(user_id, &patch).await?;
    state
        .db
        .log_action(Some(manager.id), user_id, "Updated user profile")
        .await?;
    info!(manager_id = manager.id, user_id, "用户资料已更新");
    Ok(Json(user))
}

async fn delete_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    user_id: IdPath,
) -> GatewayResult<StatusCode> {
    let manager = authorize(&state, &headers, Role::Manager).await?;
    let Path(user_id) = validated(user_id)?;
    if user_id == manager.id {
        return Err(GatewayError::Validation("cannot delete yourself".to_string()));
    }

    state.db.delete_user(user_id).await?;
    info!(manager_id = manager.id, user_id, "用户已删除");
    Ok(StatusCode::NO_CONTENT)
}

// ---- 报告 ----

async fn list_reports(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> GatewayResult<Json<Vec<ReportSummary>>> {
    let user = authorize(&state, &headers, Role::User).await?;
    let reports = state.db.reports_for_owner(user.id).await?;
    Ok(Json(reports.iter().map(AnalysisReport::summary).collect()))
}

async fn report_info(
    State(state): State<AppState>,
    headers: HeaderMap,
    report_id: Result<Path<String>, PathRejection>,
) -> GatewayResult<Json<AnalysisReport>> {
    let user = authorize(&state, &headers, Role::User).await?;
    let Path(report_id) = validated(report_id)?;
    let report = state
        .db
        .get_report(&report_id)
        .await?
        .filter(|r| r.is_exist)
        .ok_or(GatewayError::ReportNotFound)?;

    if !report.access_type.permits(report.owner_id, &user) {
        return Err(GatewayError::AccessDenied);
    }
    Ok(Json(report))
}

// ---- 收藏 ----

async fn list_bookmarks(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> GatewayResult<Json<Vec<Bookmark>>> {
    let user = authorize(&state, &headers, Role::User).await?;
    Ok(Json(state.db.bookmarks_for_user(user.id).await?))
}

async fn add_bookmark(
    State(state): State<AppState>,
    headers: HeaderMap,
    bookmark: JsonBody<NewBookmark>,
) -> GatewayResult<(StatusCode, Json<Bookmark>)> {
    let user = authorize(&state, &headers, Role::User).await?;
    let Json(bookmark) = validated(bookmark)?;
    let created = state.db.create_bookmark(user.id, &bookmark).await?;
    state
        .db
        .log_action(
            Some(user.id),
            user.id,
            &format!("Bookmarked product {}", created.product_id),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// 收藏者本人或 manager 以上可读
async fn bookmark_info(
    State(state): State<AppState>,
    headers: HeaderMap,
    bookmark_id: IdPath,
) -> GatewayResult<Json<Bookmark>> {
    let user = authorize(&state, &headers, Role::User).await?;
    let Path(bookmark_id) = validated(bookmark_id)?;
    let bookmark = state
        .db
        .get_bookmark(bookmark_id)
        .await?
        .ok_or(GatewayError::BookmarkNotFound(bookmark_id))?;

    if bookmark.user_id != user.id && user.role.access_level() < Role::Manager.access_level() {
        return Err(GatewayError::AccessDenied);
    }
    Ok(Json(bookmark))
}

async fn remove_bookmark(
    State(state): State<AppState>,
    headers: HeaderMap,
    bookmark_id: IdPath,
) -> GatewayResult<StatusCode> {
    let user = authorize(&state, &headers, Role::User).await?;
    let Path(bookmark_id) = validated(bookmark_id)?;
    state.db.delete_bookmark(bookmark_id, user.id).await?;
    state
        .db
        .log_action(
            Some(user.id),
            user.id,
            &format!("Removed bookmark {}", bookmark_id),
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---- 搜索历史 ----

async fn list_history(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> GatewayResult<Json<Vec<HistoryEntry>>> {
    let user = authorize(&state, &headers, Role::User).await?;
    Ok(Json(state.db.history_for_user(user.id).await?))
}

async fn add_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    entry: JsonBody<NewHistoryEntry>,
) -> GatewayResult<(StatusCode, Json<HistoryEntry>)> {
    let user = authorize(&state, &headers, Role::User).await?;
    let Json(entry) = validated(entry)?;
    let created = state.db.add_history(user.id, &entry).await?;
    state
        .db
        .log_action(
            Some(user.id),
            user.id,
            &format!("Started searching for product {}", created.title),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn clear_history(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> GatewayResult<StatusCode> {
    let user = authorize(&state, &headers, Role::User).await?;
    let removed = state.db.clear_history(user.id).await?;
    state
        .db
        .log_action(Some(user.id), user.id, "Cleared search history")
        .await?;
    info!(user_id = user.id, "清空搜索历史 {} 条", removed);
    Ok(StatusCode::NO_CONTENT)
}

// ---- 管理 ----

async fn user_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> GatewayResult<Json<Vec<NewUserStats>>> {
    authorize(&state, &headers, Role::Manager).await?;
    Ok(Json(state.db.new_user_stats().await?))
}

async fn all_activity(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> GatewayResult<Json<Vec<ActivityLog>>> {
    authorize(&state, &headers, Role::Manager).await?;
    Ok(Json(state.db.all_activity().await?))
}

async fn user_activity(
    State(state): State<AppState>,
    headers: HeaderMap,
    user_id: IdPath,
) -> GatewayResult<Json<Vec<ActivityLog>>> {
    authorize(&state, &headers, Role::Manager).await?;
    let Path(user_id) = validated(user_id)?;
    if state.db.get_user(user_id).await?.is_none() {
        return Err(GatewayError::UserNotFound(user_id));
    }
    Ok(Json(state.db.activity_for_user(user_id).await?))
}

async fn credit_tokens(
    State(state): State<AppState>,
    headers: HeaderMap,
    user_id: IdPath,
    request: JsonBody<TokensRequest>,
) -> GatewayResult<Json<User>> {
    let manager = authorize(&state, &headers, Role::Manager).await?;
    let Path(user_id) = validated(user_id)?;
    let Json(request) = validated(request)?;
    if request.amount <= 0 {
        return Err(GatewayError::Validation("amount must be positive".to_string()));
    }

    let user = state.db.add_tokens(user_id, request.amount).await?;
    state
        .db
        .log_action(
            Some(manager.id),
            user_id,
            &format!("Credited {} tokens", request.amount),
        )
        .await?;
    info!(manager_id = manager.id, user_id, "充值 {} token", request.amount);
    Ok(Json(user))
}

async fn change_role(
    State(state): State<AppState>,
    headers: HeaderMap,
    user_id: IdPath,
    request: JsonBody<RoleRequest>,
) -> GatewayResult<Json<User>> {
    let admin = authorize(&state, &headers, Role::Admin).await?;
    let Path(user_id) = validated(user_id)?;
    let Json(request) = validated(request)?;
    let user = state.db.set_role(user_id, request.role).await?;
    state
        .db
        .log_action(
            Some(admin.id),
            user_id,
            &format!("Changed role to {}", request.role),
        )
        .await?;
    info!(admin_id = admin.id, user_id, "角色变更为 {}", request.role);
    Ok(Json(user))
}

async fn ban_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    user_id: IdPath,
) -> GatewayResult<Json<User>> {
    set_active(state, headers, user_id, false).await
}

async fn unban_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    user_id: IdPath,
) -> GatewayResult<Json<User>> {
    set_active(state, headers, user_id, true).await
}

async fn set_active(
    state: AppState,
    headers: HeaderMap,
    user_id: IdPath,
    active: bool,
) -> GatewayResult<Json<User>> {
    let manager = authorize(&state, &headers, Role::Manager).await?;
    let Path(user_id) = validated(user_id)?;
    if user_id == manager.id {
        return Err(GatewayError::Validation("cannot change your own status".to_string()));
    }

    let user = state.db.set_active(user_id, active).await?;
    let action = if active { "Unbanned" } else { "Banned" };
    state
        .db
        .log_action(Some(manager.id), user_id, action)
        .await?;
    info!(manager_id = manager.id, user_id, "{}", action);
    Ok(Json(user))
}
