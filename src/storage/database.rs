use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::{info, warn};

use crate::cas::models::AnalysisType;
use crate::storage::models::{
    ActivityLog, AnalysisReport, Bookmark, HistoryEntry, NewBookmark, NewHistoryEntry, NewReport,
    NewUser, NewUserStats, Role, User, UserPatch,
};
use crate::utils::{GatewayError, GatewayResult};

const USER_COLUMNS: &str =
    "id, first_name, last_name, username, role, tokens, is_active, is_accept_terms, created_profile";

/// 数据库访问层，每次写入都是单条语句、立即提交
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> GatewayResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(SqliteConnectOptions::from_str(database_url)?.create_if_missing(true))
            .await?;

        info!("数据库连接成功: {}", database_url);
        Ok(Self { pool })
    }

    /// 内存数据库，只保留一个连接，否则每个连接各自一份数据
    pub async fn in_memory() -> GatewayResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(SqliteConnectOptions::from_str("sqlite::memory:")?)
            .await?;

        let db = Self { pool };
        db.init_schema().await?;
        Ok(db)
    }

    pub async fn init_schema(&self) -> GatewayResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY,
                first_name TEXT NOT NULL,
                last_name TEXT,
                username TEXT,
                role TEXT NOT NULL DEFAULT 'user',
                tokens INTEGER NOT NULL DEFAULT 10 CHECK (tokens >= 0),
                is_active INTEGER NOT NULL DEFAULT 1,
                is_accept_terms INTEGER NOT NULL DEFAULT 0,
                created_profile TEXT DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS activity_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_from INTEGER,
                user_to INTEGER NOT NULL,
                action TEXT NOT NULL,
                date TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                FOREIGN KEY (user_from) REFERENCES users(id),
                FOREIGN KEY (user_to) REFERENCES users(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS analysis_reports (
                id TEXT PRIMARY KEY,
                owner_id INTEGER NOT NULL,
                access_type TEXT NOT NULL DEFAULT 'bot_users',
                formation_date TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                is_exist INTEGER NOT NULL DEFAULT 1,
                product_name_id TEXT NOT NULL,
                product_image_url TEXT NOT NULL,
                title TEXT NOT NULL,
                analysis_interests_reviewers_data_json TEXT,
                analysis_interests_commentators_data_json TEXT,
                analysis_sentiment_reviewers_region_data_json TEXT,
                analysis_sentiment_commentators_region_data_json TEXT,
                analysis_sentiment_reviewers_category_data_json TEXT,
                analysis_sentiment_commentators_category_data_json TEXT,
                analysis_similarity_reviewers_category_data_json TEXT,
                analysis_similarity_commentators_category_data_json TEXT,
                analysis_similarity_reviewers_reputation_data_json TEXT,
                analysis_similarity_commentators_reputation_data_json TEXT,
                FOREIGN KEY (owner_id) REFERENCES users(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bookmarks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                product_id TEXT NOT NULL,
                title TEXT NOT NULL,
                url TEXT NOT NULL,
                url_photo TEXT,
                date TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                user_id INTEGER NOT NULL,
                UNIQUE (user_id, product_id),
                FOREIGN KEY (user_id) REFERENCES users(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                url TEXT NOT NULL,
                date TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                user_id INTEGER NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("数据库表结构初始化完成");
        Ok(())
    }

    // ---- users ----

    pub async fn create_user(&self, user: &NewUser, tokens: i64) -> GatewayResult<User> {
        if self.get_user(user.id).await?.is_some() {
            return Err(GatewayError::UserExists(user.id));
        }

        sqlx::query(
            "INSERT INTO users (id, first_name, last_name, username, tokens) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(user.id)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(&user.username)
        .bind(tokens)
        .execute(&self.pool)
        .await?;

        self.require_user(user.id).await
    }

    pub async fn get_user(&self, user_id: i64) -> GatewayResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {} FROM users WHERE id = ?",
            USER_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn require_user(&self, user_id: i64) -> GatewayResult<User> {
        self.get_user(user_id)
            .await?
            .ok_or(GatewayError::UserNotFound(user_id))
    }

    async fn update_user(&self, sql: &str, user_id: i64, bind: UserUpdate) -> GatewayResult<User> {
        let query = sqlx::query(sql);
        let query = match bind {
            UserUpdate::Role(role) => query.bind(role),
            UserUpdate::Flag(flag) => query.bind(flag),
        };
        let result = query.bind(user_id).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(GatewayError::UserNotFound(user_id));
        }
        self.require_user(user_id).await
    }

    pub async fn set_role(&self, user_id: i64, role: Role) -> GatewayResult<User> {
        self.update_user("UPDATE users SET role = ? WHERE id = ?", user_id, UserUpdate::Role(role))
            .await
    }

    /// 充值；结果超出 i64 时整条更新不生效，避免 SQLite 把余额转成 REAL
    pub async fn add_tokens(&self, user_id: i64, amount: i64) -> GatewayResult<User> {
        if amount < 0 {
            return Err(GatewayError::Validation("token amount must be positive".to_string()));
        }
        let result = sqlx::query("UPDATE users SET tokens = tokens + ? WHERE id = ? AND tokens <= ?")
            .bind(amount)
            .bind(user_id)
            .bind(i64::MAX - amount)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            let user = self.require_user(user_id).await?;
            warn!(user_id, balance = user.tokens, "充值 {} 会溢出，已拒绝", amount);
            return Err(GatewayError::Validation(
                "token balance would overflow".to_string(),
            ));
        }
        self.require_user(user_id).await
    }

    pub async fn set_active(&self, user_id: i64, active: bool) -> GatewayResult<User> {
        self.update_user(
            "UPDATE users SET is_active = ? WHERE id = ?",
            user_id,
            UserUpdate::Flag(active),
        )
        .await
    }

    pub async fn accept_terms(&self, user_id: i64) -> GatewayResult<User> {
        self.update_user(
            "UPDATE users SET is_accept_terms = ? WHERE id = ?",
            user_id,
            UserUpdate::Flag(true),
        )
        .await
    }

    /// 只更新 patch 中给出的字段
    pub async fn patch_user(&self, user_id: i64, patch: &UserPatch) -> GatewayResult<User> {
        if patch.tokens.is_some_and(|t| t < 0) {
            return Err(GatewayError::Validation("tokens must not be negative".to_string()));
        }

        let result = sqlx::query(
            r#"
            UPDATE users SET
                first_name = COALESCE(?, first_name),
                last_name = COALESCE(?, last_name),
                username = COALESCE(?, username),
                role = COALESCE(?, role),
                tokens = COALESCE(?, tokens),
                is_active = COALESCE(?, is_active),
                is_accept_terms = COALESCE(?, is_accept_terms)
            WHERE id = ?
            "#,
        )
        .bind(&patch.first_name)
        .bind(&patch.last_name)
        .bind(&patch.username)
        .bind(patch.role)
        .bind(patch.tokens)
        .bind(patch.is_active)
        .bind(patch.is_accept_terms)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(GatewayError::UserNotFound(user_id));
        }
        self.require_user(user_id).await
    }

    /// 删除用户及其收藏、历史和活动记录；名下还有报告时拒绝
    pub async fn delete_user(&self, user_id: i64) -> GatewayResult<()> {
        self.require_user(user_id).await?;

        let (reports,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM analysis_reports WHERE owner_id = ?")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?;
        if reports > 0 {
            return Err(GatewayError::Validation(format!(
                "user {} still owns {} reports",
                user_id, reports
            )));
        }

        let mut tx = self.pool.begin().await?;
        for sql in [
            "DELETE FROM bookmarks WHERE user_id = ?",
            "DELETE FROM history WHERE user_id = ?",
            "DELETE FROM activity_logs WHERE user_to = ?",
            "UPDATE activity_logs SET user_from = NULL WHERE user_from = ?",
            "DELETE FROM users WHERE id = ?",
        ] {
            sqlx::query(sql).bind(user_id).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn new_user_stats(&self) -> GatewayResult<Vec<NewUserStats>> {
        let stats = sqlx::query_as::<_, NewUserStats>(
            r#"
            SELECT date(created_profile) AS registration_date, COUNT(*) AS user_count
            FROM users
            WHERE created_profile IS NOT NULL
            GROUP BY date(created_profile)
            ORDER BY registration_date
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(stats)
    }

    /// 原子扣减，余额不足时不修改任何数据
    pub async fn debit_tokens(&self, user_id: i64, cost: i64) -> GatewayResult<()> {
        let result = sqlx::query("UPDATE users SET tokens = tokens - ? WHERE id = ? AND tokens >= ?")
            .bind(cost)
            .bind(user_id)
            .bind(cost)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(GatewayError::InsufficientTokens);
        }
        Ok(())
    }

    // ---- activity logs ----

    pub async fn log_action(
        &self,
        user_from: Option<i64>,
        user_to: i64,
        action: &str,
    ) -> GatewayResult<()> {
        sqlx::query("INSERT INTO activity_logs (user_from, user_to, action) VALUES (?, ?, ?)")
            .bind(user_from)
            .bind(user_to)
            .bind(action)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn activity_for_user(&self, user_id: i64) -> GatewayResult<Vec<ActivityLog>> {
        let logs = sqlx::query_as::<_, ActivityLog>(
            "SELECT id, user_from, user_to, action, date FROM activity_logs WHERE user_to = ? ORDER BY id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(logs)
    }

    pub async fn all_activity(&self) -> GatewayResult<Vec<ActivityLog>> {
        let logs = sqlx::query_as::<_, ActivityLog>(
            "SELECT id, user_from, user_to, action, date FROM activity_logs ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(logs)
    }

    // ---- bookmarks ----

    pub async fn create_bookmark(
        &self,
        user_id: i64,
        bookmark: &NewBookmark,
    ) -> GatewayResult<Bookmark> {
        let inserted = sqlx::query(
            "INSERT INTO bookmarks (product_id, title, url, url_photo, user_id) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&bookmark.product_id)
        .bind(&bookmark.title)
        .bind(&bookmark.url)
        .bind(&bookmark.photo_url)
        .bind(user_id)
        .execute(&self.pool)
        .await;

        let id = match inserted {
            Ok(result) => result.last_insert_rowid(),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                return Err(GatewayError::BookmarkExists(bookmark.product_id.clone()))
            }
            Err(e) => return Err(e.into()),
        };

        self.get_bookmark(id)
            .await?
            .ok_or(GatewayError::BookmarkNotFound(id))
    }

    pub async fn get_bookmark(&self, bookmark_id: i64) -> GatewayResult<Option<Bookmark>> {
        let bookmark = sqlx::query_as::<_, Bookmark>("SELECT * FROM bookmarks WHERE id = ?")
            .bind(bookmark_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(bookmark)
    }

    pub async fn bookmarks_for_user(&self, user_id: i64) -> GatewayResult<Vec<Bookmark>> {
        let bookmarks =
            sqlx::query_as::<_, Bookmark>("SELECT * FROM bookmarks WHERE user_id = ? ORDER BY id")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(bookmarks)
    }

    /// 只有收藏者本人能删除
    pub async fn delete_bookmark(&self, bookmark_id: i64, caller_id: i64) -> GatewayResult<()> {
        let bookmark = self
            .get_bookmark(bookmark_id)
            .await?
            .ok_or(GatewayError::BookmarkNotFound(bookmark_id))?;
        if bookmark.user_id != caller_id {
            return Err(GatewayError::ForeignBookmark);
        }

        sqlx::query("DELETE FROM bookmarks WHERE id = ? AND user_id = ?")
            .bind(bookmark_id)
            .bind(caller_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---- search history ----

    pub async fn add_history(
        &self,
        user_id: i64,
        entry: &NewHistoryEntry,
    ) -> GatewayResult<HistoryEntry> {
        let id = sqlx::query("INSERT INTO history (title, url, user_id) VALUES (?, ?, ?)")
            .bind(&entry.title)
            .bind(&entry.url)
            .bind(user_id)
            .execute(&self.pool)
            .await?
            .last_insert_rowid();

        let entry = sqlx::query_as::<_, HistoryEntry>("SELECT * FROM history WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(entry)
    }

    pub async fn history_for_user(&self, user_id: i64) -> GatewayResult<Vec<HistoryEntry>> {
        let entries = sqlx::query_as::<_, HistoryEntry>(
            "SELECT * FROM history WHERE user_id = ? ORDER BY date, id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    /// 返回删除的条数
    pub async fn clear_history(&self, user_id: i64) -> GatewayResult<u64> {
        let result = sqlx::query("DELETE FROM history WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // ---- analysis reports ----

    pub async fn create_report(&self, report: &NewReport) -> GatewayResult<AnalysisReport> {
        if self.get_report(&report.id).await?.is_some() {
            return Err(GatewayError::DuplicateReport);
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO analysis_reports (id, owner_id, access_type, product_name_id, product_image_url, title)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&report.id)
        .bind(report.owner_id)
        .bind(report.access_type)
        .bind(&report.product_name_id)
        .bind(&report.product_image_url)
        .bind(&report.title)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => {}
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                return Err(GatewayError::DuplicateReport)
            }
            Err(e) => return Err(e.into()),
        }

        self.get_report(&report.id)
            .await?
            .ok_or(GatewayError::ReportNotFound)
    }

    pub async fn get_report(&self, report_id: &str) -> GatewayResult<Option<AnalysisReport>> {
        let report = sqlx::query_as::<_, AnalysisReport>("SELECT * FROM analysis_reports WHERE id = ?")
            .bind(report_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(report)
    }

    pub async fn reports_for_owner(&self, owner_id: i64) -> GatewayResult<Vec<AnalysisReport>> {
        let reports = sqlx::query_as::<_, AnalysisReport>(
            "SELECT * FROM analysis_reports WHERE owner_id = ? AND is_exist = 1 ORDER BY formation_date DESC",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(reports)
    }

    /// 写入报告的某个分析槽位，槽位只写一次；返回是否实际写入
    pub async fn write_report_slot(
        &self,
        report_id: &str,
        caller_id: i64,
        analysis_type: AnalysisType,
        json: &str,
    ) -> GatewayResult<bool> {
        let report = self
            .get_report(report_id)
            .await?
            .filter(|r| r.is_exist)
            .ok_or(GatewayError::ReportNotFound)?;

        if report.owner_id != caller_id {
            return Err(GatewayError::NotOwner);
        }

        let sql = format!(
            "UPDATE analysis_reports SET {col} = ? WHERE id = ? AND owner_id = ? AND {col} IS NULL",
            col = analysis_type.report_column()
        );
        let result = sqlx::query(&sql)
            .bind(json)
            .bind(report_id)
            .bind(caller_id)
            .execute(&self.pool)
            .await?;

        let written = result.rows_affected() == 1;
        if !written {
            warn!(report_id, %analysis_type, "槽位已有数据，跳过写入");
        }
        Ok(written)
    }
}

enum UserUpdate {
    Role(Role),
    Flag(bool),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::models::AccessType;
    use crate::testing::{new_report, seed_user};

    #[tokio::test]
    async fn duplicate_report_is_rejected_and_original_kept() {
        let db = Database::in_memory().await.unwrap();
        seed_user(&db, 1, Role::User, 10).await;
        seed_user(&db, 2, Role::User, 10).await;

        let report = new_report("p-1", 1);
        db.create_report(&report).await.unwrap();
        db.write_report_slot("p-1", 1, AnalysisType::InterestReviewers, r#"{"x":1}"#)
            .await
            .unwrap();

        let mut replay = new_report("p-1", 2);
        replay.title = "other".into();
        let err = db.create_report(&replay).await.unwrap_err();
        assert!(matches!(err, GatewayError::DuplicateReport));

        let stored = db.get_report("p-1").await.unwrap().unwrap();
        assert_eq!(stored.owner_id, 1);
        assert_eq!(stored.title, report.title);
        assert_eq!(stored.slot(AnalysisType::InterestReviewers), Some(r#"{"x":1}"#));
    }

    #[tokio::test]
    async fn foreign_owner_cannot_write_slots() {
        let db = Database::in_memory().await.unwrap();
        seed_user(&db, 1, Role::User, 10).await;
        seed_user(&db, 2, Role::Admin, 10).await;
        db.create_report(&new_report("p-2", 1)).await.unwrap();

        let err = db
            .write_report_slot("p-2", 2, AnalysisType::SentimentRegionReviewers, "{}")
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NotOwner));

        let stored = db.get_report("p-2").await.unwrap().unwrap();
        assert!(stored.filled_slots().is_empty());
    }

    #[tokio::test]
    async fn writing_into_missing_report_fails() {
        let db = Database::in_memory().await.unwrap();
        seed_user(&db, 1, Role::User, 10).await;

        let err = db
            .write_report_slot("nope", 1, AnalysisType::InterestReviewers, "{}")
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ReportNotFound));
    }

    #[tokio::test]
    async fn slots_are_write_once() {
        let db = Database::in_memory().await.unwrap();
        seed_user(&db, 1, Role::User, 10).await;
        db.create_report(&new_report("p-3", 1)).await.unwrap();

        let t = AnalysisType::SimilarityCategoryCommentators;
        assert!(db.write_report_slot("p-3", 1, t, r#"{"a":1}"#).await.unwrap());
        assert!(!db.write_report_slot("p-3", 1, t, r#"{"a":2}"#).await.unwrap());

        let stored = db.get_report("p-3").await.unwrap().unwrap();
        assert_eq!(stored.slot(t), Some(r#"{"a":1}"#));
        assert_eq!(stored.filled_slots(), vec![t]);
        assert_eq!(stored.access_type, AccessType::BotUsers);
    }

    #[tokio::test]
    async fn debit_never_goes_negative() {
        let db = Database::in_memory().await.unwrap();
        seed_user(&db, 7, Role::User, 3).await;

        db.debit_tokens(7, 2).await.unwrap();
        let err = db.debit_tokens(7, 2).await.unwrap_err();
        assert!(matches!(err, GatewayError::InsufficientTokens));
        assert_eq!(db.get_user(7).await.unwrap().unwrap().tokens, 1);
    }

    #[tokio::test]
    async fn user_updates_and_activity() {
        let db = Database::in_memory().await.unwrap();
        seed_user(&db, 5, Role::User, 0).await;

        let user = db.set_role(5, Role::Manager).await.unwrap();
        assert_eq!(user.role, Role::Manager);
        let user = db.add_tokens(5, 4).await.unwrap();
        assert_eq!(user.tokens, 4);
        let user = db.set_active(5, false).await.unwrap();
        assert!(!user.is_active);

        db.log_action(None, 5, "role changed to manager").await.unwrap();
        let logs = db.activity_for_user(5).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].action, "role changed to manager");

        assert!(matches!(
            db.set_role(404, Role::Admin).await,
            Err(GatewayError::UserNotFound(404))
        ));
        assert!(matches!(
            db.create_user(
                &NewUser {
                    id: 5,
                    first_name: "dup".into(),
                    last_name: None,
                    username: None,
                },
                1
            )
            .await,
            Err(GatewayError::UserExists(5))
        ));
    }

    #[tokio::test]
    async fn credit_that_would_overflow_is_rejected() {
        let db = Database::in_memory().await.unwrap();
        seed_user(&db, 1, Role::User, 5).await;

        let err = db.add_tokens(1, i64::MAX).await.unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));

        let user = db.get_user(1).await.unwrap().unwrap();
        assert_eq!(user.tokens, 5);

        let user = db.add_tokens(1, i64::MAX - 5).await.unwrap();
        assert_eq!(user.tokens, i64::MAX);
        assert!(matches!(
            db.add_tokens(1, 1).await,
            Err(GatewayError::Validation(_))
        ));
        assert!(matches!(
            db.add_tokens(404, 1).await,
            Err(GatewayError::UserNotFound(404))
        ));
    }

    #[tokio::test]
    async fn patch_only_touches_given_fields() {
        let db = Database::in_memory().await.unwrap();
        seed_user(&db, 1, Role::User, 5).await;

        let patch = UserPatch {
            username: Some("renamed".into()),
            is_active: Some(false),
            ..Default::default()
        };
        let user = db.patch_user(1, &patch).await.unwrap();
        assert_eq!(user.username.as_deref(), Some("renamed"));
        assert!(!user.is_active);
        assert_eq!(user.tokens, 5);
        assert_eq!(user.role, Role::User);

        let negative = UserPatch {
            tokens: Some(-1),
            ..Default::default()
        };
        assert!(matches!(
            db.patch_user(1, &negative).await,
            Err(GatewayError::Validation(_))
        ));
        assert!(matches!(
            db.patch_user(404, &patch).await,
            Err(GatewayError::UserNotFound(404))
        ));
    }

    #[tokio::test]
    async fn bookmarks_belong_to_their_owner() {
        let db = Database::in_memory().await.unwrap();
        seed_user(&db, 1, Role::User, 0).await;
        seed_user(&db, 2, Role::User, 0).await;

        let new = NewBookmark {
            product_id: "chelgu".into(),
            title: "Chelgu".into(),
            url: "https://cas.example/chelgu".into(),
            photo_url: None,
        };
        let bookmark = db.create_bookmark(1, &new).await.unwrap();
        assert_eq!(bookmark.user_id, 1);
        assert!(matches!(
            db.create_bookmark(1, &new).await,
            Err(GatewayError::BookmarkExists(_))
        ));
        db.create_bookmark(2, &new).await.unwrap();

        assert!(matches!(
            db.delete_bookmark(bookmark.id, 2).await,
            Err(GatewayError::ForeignBookmark)
        ));
        db.delete_bookmark(bookmark.id, 1).await.unwrap();
        assert!(db.get_bookmark(bookmark.id).await.unwrap().is_none());
        assert!(matches!(
            db.delete_bookmark(bookmark.id, 1).await,
            Err(GatewayError::BookmarkNotFound(_))
        ));
        assert_eq!(db.bookmarks_for_user(2).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn history_is_kept_per_user() {
        let db = Database::in_memory().await.unwrap();
        seed_user(&db, 1, Role::User, 0).await;
        seed_user(&db, 2, Role::User, 0).await;

        for title in ["first", "second"] {
            let entry = NewHistoryEntry {
                title: title.into(),
                url: format!("https://cas.example/{}", title),
            };
            db.add_history(1, &entry).await.unwrap();
        }
        db.add_history(
            2,
            &NewHistoryEntry {
                title: "other".into(),
                url: "https://cas.example/other".into(),
            },
        )
        .await
        .unwrap();

        let entries = db.history_for_user(1).await.unwrap();
        let titles: Vec<_> = entries.iter().map(|e| e.title.as_str()).collect();
        assert_eq!(titles, ["first", "second"]);

        assert_eq!(db.clear_history(1).await.unwrap(), 2);
        assert!(db.history_for_user(1).await.unwrap().is_empty());
        assert_eq!(db.history_for_user(2).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn deleting_user_cleans_up_owned_rows() {
        let db = Database::in_memory().await.unwrap();
        seed_user(&db, 1, Role::User, 0).await;
        seed_user(&db, 2, Role::Manager, 0).await;
        db.add_history(
            1,
            &NewHistoryEntry {
                title: "x".into(),
                url: "https://cas.example/x".into(),
            },
        )
        .await
        .unwrap();
        db.log_action(Some(1), 2, "searched").await.unwrap();
        db.log_action(Some(2), 1, "credited").await.unwrap();

        db.delete_user(1).await.unwrap();
        assert!(db.get_user(1).await.unwrap().is_none());
        assert!(db.history_for_user(1).await.unwrap().is_empty());

        let logs = db.all_activity().await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].user_to, 2);
        assert_eq!(logs[0].user_from, None);

        seed_user(&db, 3, Role::User, 0).await;
        db.create_report(&new_report("r-3", 3)).await.unwrap();
        assert!(matches!(
            db.delete_user(3).await,
            Err(GatewayError::Validation(_))
        ));
        assert!(matches!(
            db.delete_user(404).await,
            Err(GatewayError::UserNotFound(404))
        ));
    }

    #[tokio::test]
    async fn stats_group_new_users_by_day() {
        let db = Database::in_memory().await.unwrap();
        seed_user(&db, 1, Role::User, 0).await;
        seed_user(&db, 2, Role::User, 0).await;

        let stats = db.new_user_stats().await.unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].user_count, 2);
        assert_eq!(stats[0].registration_date.len(), "2024-01-01".len());
    }
}
