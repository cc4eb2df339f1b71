use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;

use crate::cas::models::AnalysisType;

/// 用户角色，访问级别 user=0 < manager=1 < admin=2
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Role {
    User,
    Manager,
    Admin,
}

impl Role {
    pub fn access_level(self) -> u8 {
        match self {
            Role::User => 0,
            Role::Manager => 1,
            Role::Admin => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Manager => "manager",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "manager" => Ok(Role::Manager),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: i64,
    pub first_name: String,
    pub last_name: Option<String>,
    pub username: Option<String>,
    pub role: Role,
    pub tokens: i64,
    pub is_active: bool,
    pub is_accept_terms: bool,
    pub created_profile: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewUser {
    pub id: i64,
    pub first_name: String,
    pub last_name: Option<String>,
    pub username: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ActivityLog {
    pub id: i64,
    pub user_from: Option<i64>,
    pub user_to: i64,
    pub action: String,
    pub date: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum AccessType {
    Public,
    BotUsers,
    Private,
}

impl AccessType {
    /// 报告读取权限：private 仅所有者或 manager 以上可读
    pub fn permits(self, owner_id: i64, reader: &User) -> bool {
        match self {
            AccessType::Public | AccessType::BotUsers => true,
            AccessType::Private => {
                reader.id == owner_id || reader.role.access_level() >= Role::Manager.access_level()
            }
        }
    }
}

/// 分析报告，id 即流水线 id，每种分析类型对应一个 JSON 槽位
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AnalysisReport {
    pub id: String,
    pub owner_id: i64,
    pub access_type: AccessType,
    pub formation_date: String,
    pub is_exist: bool,
    pub product_name_id: String,
    pub product_image_url: String,
    pub title: String,
    pub analysis_interests_reviewers_data_json: Option<String>,
    pub analysis_interests_commentators_data_json: Option<String>,
    pub analysis_sentiment_reviewers_region_data_json: Option<String>,
    pub analysis_sentiment_commentators_region_data_json: Option<String>,
    pub analysis_sentiment_reviewers_category_data_json: Option<String>,
    pub analysis_sentiment_commentators_category_data_json: Option<String>,
    pub analysis_similarity_reviewers_category_data_json: Option<String>,
    pub analysis_similarity_commentators_category_data_json: Option<String>,
    pub analysis_similarity_reviewers_reputation_data_json: Option<String>,
    pub analysis_similarity_commentators_reputation_data_json: Option<String>,
}

impl AnalysisReport {
    pub fn slot(&self, analysis_type: AnalysisType) -> Option<&str> {
        let slot = match analysis_type {
            AnalysisType::InterestReviewers => &self.analysis_interests_reviewers_data_json,
            AnalysisType::InterestCommentators => &self.analysis_interests_commentators_data_json,
            AnalysisType::SentimentCategoryReviewers => {
                &self.analysis_sentiment_reviewers_category_data_json
            }
            AnalysisType::SentimentCategoryCommentators => {
                &self.analysis_sentiment_commentators_category_data_json
            }
            AnalysisType::SentimentRegionReviewers => &self.analysis_sentiment_reviewers_region_data_json,
            AnalysisType::SentimentRegionCommentators => {
                &self.analysis_sentiment_commentators_region_data_json
            }
            AnalysisType::SimilarityReputationReviewers => {
                &self.analysis_similarity_reviewers_reputation_data_json
            }
            AnalysisType::SimilarityReputationCommentators => {
                &self.analysis_similarity_commentators_reputation_data_json
            }
            AnalysisType::SimilarityCategoryReviewers => {
                &self.analysis_similarity_reviewers_category_data_json
            }
            AnalysisType::SimilarityCategoryCommentators => {
                &self.analysis_similarity_commentators_category_data_json
            }
        };
        slot.as_deref()
    }

    pub fn filled_slots(&self) -> Vec<AnalysisType> {
        AnalysisType::ALL
            .iter()
            .copied()
            .filter(|t| self.slot(*t).is_some())
            .collect()
    }

    pub fn summary(&self) -> ReportSummary {
        ReportSummary {
            id: self.id.clone(),
            owner_id: self.owner_id,
            access_type: self.access_type,
            product_name_id: self.product_name_id.clone(),
            product_image_url: self.product_image_url.clone(),
            title: self.title.clone(),
            formation_date: self.formation_date.clone(),
            filled_slots: self.filled_slots(),
        }
    }
}

/// 列表接口返回的报告概要（不含 JSON 数据）
#[derive(Debug, Clone, Serialize)]
pub struct ReportSummary {
    pub id: String,
    pub owner_id: i64,
    pub access_type: AccessType,
    pub product_name_id: String,
    pub product_image_url: String,
    pub title: String,
    pub formation_date: String,
    pub filled_slots: Vec<AnalysisType>,
}

#[derive(Debug, Clone)]
pub struct NewReport {
    pub id: String,
    pub owner_id: i64,
    pub access_type: AccessType,
    pub product_name_id: String,
    pub product_image_url: String,
    pub title: String,
}

/// 管理员对用户的部分更新，缺省字段保持不变
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserPatch {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub username: Option<String>,
    pub role: Option<Role>,
    pub tokens: Option<i64>,
    pub is_active: Option<bool>,
    pub is_accept_terms: Option<bool>,
}

impl UserPatch {
    pub fn is_empty(&self) -> bool {
        self.first_name.is_none()
            && self.last_name.is_none()
            && self.username.is_none()
            && self.role.is_none()
            && self.tokens.is_none()
            && self.is_active.is_none()
            && self.is_accept_terms.is_none()
    }
}

/// 按注册日期统计的新用户数
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct NewUserStats {
    pub registration_date: String,
    pub user_count: i64,
}

/// 收藏的商品，同一用户对同一商品只收藏一次
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Bookmark {
    pub id: i64,
    pub product_id: String,
    pub title: String,
    pub url: String,
    pub url_photo: Option<String>,
    pub date: String,
    pub user_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewBookmark {
    pub product_id: String,
    pub title: String,
    pub url: String,
    pub photo_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct HistoryEntry {
    pub id: i64,
    pub title: String,
    pub url: String,
    pub date: String,
    pub user_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewHistoryEntry {
    pub title: String,
    pub url: String,
}
