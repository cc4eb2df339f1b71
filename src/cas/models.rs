use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::utils::{GatewayError, GatewayResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CasTask {
    pub task_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CasPipeline {
    pub pipeline_id: Uuid,
}

/// get_task_result 的两种结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskPoll {
    Ready(Vec<u8>),
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductInfo {
    pub name_id: String,
    pub fullname: String,
    pub image_url: String,
}

/// 流水线的分析类型：interest/sentiment/similarity × reviewers/commentators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisType {
    InterestReviewers,
    InterestCommentators,
    SentimentCategoryReviewers,
    SentimentCategoryCommentators,
    SentimentRegionReviewers,
    SentimentRegionCommentators,
    SimilarityReputationReviewers,
    SimilarityReputationCommentators,
    SimilarityCategoryReviewers,
    SimilarityCategoryCommentators,
}

impl AnalysisType {
    pub const ALL: [AnalysisType; 10] = [
        AnalysisType::InterestReviewers,
        AnalysisType::InterestCommentators,
        AnalysisType::SentimentCategoryReviewers,
        AnalysisType::SentimentCategoryCommentators,
        AnalysisType::SentimentRegionReviewers,
        AnalysisType::SentimentRegionCommentators,
        AnalysisType::SimilarityReputationReviewers,
        AnalysisType::SimilarityReputationCommentators,
        AnalysisType::SimilarityCategoryReviewers,
        AnalysisType::SimilarityCategoryCommentators,
    ];

    /// analysis_reports 表中对应的列
    pub fn report_column(self) -> &'static str {
        match self {
            AnalysisType::InterestReviewers => "analysis_interests_reviewers_data_json",
            AnalysisType::InterestCommentators => "analysis_interests_commentators_data_json",
            AnalysisType::SentimentCategoryReviewers => {
                "analysis_sentiment_reviewers_category_data_json"
            }
            AnalysisType::SentimentCategoryCommentators => {
                "analysis_sentiment_commentators_category_data_json"
            }
            AnalysisType::SentimentRegionReviewers => "analysis_sentiment_reviewers_region_data_json",
            AnalysisType::SentimentRegionCommentators => {
                "analysis_sentiment_commentators_region_data_json"
            }
            AnalysisType::SimilarityReputationReviewers => {
                "analysis_similarity_reviewers_reputation_data_json"
            }
            AnalysisType::SimilarityReputationCommentators => {
                "analysis_similarity_commentators_reputation_data_json"
            }
            AnalysisType::SimilarityCategoryReviewers => {
                "analysis_similarity_reviewers_category_data_json"
            }
            AnalysisType::SimilarityCategoryCommentators => {
                "analysis_similarity_commentators_category_data_json"
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AnalysisType::InterestReviewers => "interest_reviewers",
            AnalysisType::InterestCommentators => "interest_commentators",
            AnalysisType::SentimentCategoryReviewers => "sentiment_category_reviewers",
            AnalysisType::SentimentCategoryCommentators => "sentiment_category_commentators",
            AnalysisType::SentimentRegionReviewers => "sentiment_region_reviewers",
            AnalysisType::SentimentRegionCommentators => "sentiment_region_commentators",
            AnalysisType::SimilarityReputationReviewers => "similarity_reputation_reviewers",
            AnalysisType::SimilarityReputationCommentators => "similarity_reputation_commentators",
            AnalysisType::SimilarityCategoryReviewers => "similarity_category_reviewers",
            AnalysisType::SimilarityCategoryCommentators => "similarity_category_commentators",
        }
    }
}

impl fmt::Display for AnalysisType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 流水线的单个阶段描述
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineComponent {
    pub analysis_type: AnalysisType,
    pub analysis_task_id: Option<Uuid>,
    #[serde(default)]
    pub analysis_title: Option<String>,
    #[serde(default)]
    pub visualization_html_task_id: Option<Uuid>,
    #[serde(default)]
    pub visualization_html_title: Option<String>,
    #[serde(default)]
    pub visualization_image_task_id: Option<Uuid>,
    #[serde(default)]
    pub visualization_image_title: Option<String>,
}

/// 流水线请求的可视化范围
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisVisualizationType {
    #[default]
    All,
    Html,
    Image,
    None,
}

impl AnalysisVisualizationType {
    pub fn as_str(self) -> &'static str {
        match self {
            AnalysisVisualizationType::All => "all",
            AnalysisVisualizationType::Html => "html",
            AnalysisVisualizationType::Image => "image",
            AnalysisVisualizationType::None => "none",
        }
    }
}

/// 可视化输出格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VisualizationType {
    Html,
    Png,
    Jpeg,
    Svg,
}

impl VisualizationType {
    pub fn as_str(self) -> &'static str {
        match self {
            VisualizationType::Html => "html",
            VisualizationType::Png => "png",
            VisualizationType::Jpeg => "jpeg",
            VisualizationType::Svg => "svg",
        }
    }

    /// 栅格图以二进制帧下发，其余按文本
    pub fn is_binary(self) -> bool {
        matches!(self, VisualizationType::Png | VisualizationType::Jpeg)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisualizationKind {
    AnalysisValueCategory,
    AnalysisValueRegion,
    Histogram,
    QuantityCategory,
}

impl VisualizationKind {
    pub fn path(self) -> &'static str {
        match self {
            VisualizationKind::AnalysisValueCategory => "analysis_value/category",
            VisualizationKind::AnalysisValueRegion => "analysis_value/region",
            VisualizationKind::Histogram => "histogram",
            VisualizationKind::QuantityCategory => "quantity/category",
        }
    }

    pub fn takes_analysis_value_title(self) -> bool {
        !matches!(self, VisualizationKind::QuantityCategory)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomersForAllCategoriesBaseAnalysis {
    pub ru_category_1: String,
    pub ru_category_2: Option<String>,
    pub ru_category_3: Option<String>,
    pub ru_category_4: Option<String>,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomersForAllCategoriesAnalysis {
    pub ru_category_1: String,
    pub ru_category_2: Option<String>,
    pub ru_category_3: Option<String>,
    pub ru_category_4: Option<String>,
    pub count: i64,
    pub analysis_value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupRegionallyAllCustomerAnalysis {
    pub region: String,
    pub count: i64,
    pub analysis_value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerReputationAnalysisValue {
    pub customer_id: String,
    pub reputation: f64,
    pub analysis_value: f64,
}

/// 提交给可视化器的一批记录，形状由 kind 决定
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RecordBatch {
    AnalysisValueCategory(Vec<CustomersForAllCategoriesAnalysis>),
    AnalysisValueRegion(Vec<GroupRegionallyAllCustomerAnalysis>),
    Histogram(Vec<CustomerReputationAnalysisValue>),
    QuantityCategory(Vec<CustomersForAllCategoriesBaseAnalysis>),
}

impl RecordBatch {
    pub fn parse(kind: VisualizationKind, payload: &str) -> GatewayResult<Self> {
        fn records<T: serde::de::DeserializeOwned>(payload: &str) -> GatewayResult<Vec<T>> {
            serde_json::from_str(payload).map_err(|e| GatewayError::Validation(e.to_string()))
        }

        let batch = match kind {
            VisualizationKind::AnalysisValueCategory => {
                RecordBatch::AnalysisValueCategory(records(payload)?)
            }
            VisualizationKind::AnalysisValueRegion => RecordBatch::AnalysisValueRegion(records(payload)?),
            VisualizationKind::Histogram => RecordBatch::Histogram(records(payload)?),
            VisualizationKind::QuantityCategory => RecordBatch::QuantityCategory(records(payload)?),
        };

        if batch.is_empty() {
            return Err(GatewayError::Validation("empty record batch".to_string()));
        }
        Ok(batch)
    }

    pub fn kind(&self) -> VisualizationKind {
        match self {
            RecordBatch::AnalysisValueCategory(_) => VisualizationKind::AnalysisValueCategory,
            RecordBatch::AnalysisValueRegion(_) => VisualizationKind::AnalysisValueRegion,
            RecordBatch::Histogram(_) => VisualizationKind::Histogram,
            RecordBatch::QuantityCategory(_) => VisualizationKind::QuantityCategory,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            RecordBatch::AnalysisValueCategory(r) => r.len(),
            RecordBatch::AnalysisValueRegion(r) => r.len(),
            RecordBatch::Histogram(r) => r.len(),
            RecordBatch::QuantityCategory(r) => r.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct VisualizationTitles {
    pub title: String,
    pub title_object_count: String,
    pub title_analysis_value: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn every_analysis_type_has_its_own_column() {
        let columns: HashSet<_> = AnalysisType::ALL.iter().map(|t| t.report_column()).collect();
        assert_eq!(columns.len(), 10);
    }

    #[test]
    fn analysis_type_wire_names_round_trip() {
        for t in AnalysisType::ALL {
            let json = serde_json::to_string(&t).unwrap();
            assert_eq!(json, format!("\"{}\"", t.as_str()));
        }
    }

    #[test]
    fn component_list_parses_with_missing_optional_fields() {
        let raw = r#"[
            {"analysis_type": "interest_reviewers",
             "analysis_task_id": "0b6b5bde-1f4a-4c33-9d0c-2a7c7e6a1d01",
             "analysis_title": "Interests of reviewers"},
            {"analysis_type": "sentiment_category_commentators",
             "analysis_task_id": null,
             "visualization_html_task_id": "0b6b5bde-1f4a-4c33-9d0c-2a7c7e6a1d02"}
        ]"#;
        let components: Vec<PipelineComponent> = serde_json::from_str(raw).unwrap();
        assert_eq!(components.len(), 2);
        assert_eq!(components[0].analysis_type, AnalysisType::InterestReviewers);
        assert!(components[1].analysis_task_id.is_none());
        assert!(components[1].visualization_image_task_id.is_none());
    }

    #[test]
    fn record_batch_rejects_wrong_shape() {
        let region = r#"[{"region": "Chelyabinsk", "count": 3, "analysis_value": 0.4}]"#;
        assert!(RecordBatch::parse(VisualizationKind::AnalysisValueRegion, region).is_ok());

        let err = RecordBatch::parse(VisualizationKind::Histogram, region).unwrap_err();
        assert_eq!(err.status_code(), 422);

        let err = RecordBatch::parse(VisualizationKind::Histogram, "[]").unwrap_err();
        assert_eq!(err.status_code(), 422);
    }

    #[test]
    fn record_batch_serializes_as_plain_array() {
        let batch = RecordBatch::Histogram(vec![CustomerReputationAnalysisValue {
            customer_id: "c1".into(),
            reputation: 4.5,
            analysis_value: 0.9,
        }]);
        let value = serde_json::to_value(&batch).unwrap();
        assert!(value.is_array());
        assert_eq!(value[0]["customer_id"], "c1");
    }
}
