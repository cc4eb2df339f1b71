pub mod client;
pub mod models;
pub mod poller;

use async_trait::async_trait;
use uuid::Uuid;

use crate::utils::GatewayResult;
use models::{
    AnalysisVisualizationType, CasPipeline, CasTask, ProductInfo, RecordBatch, TaskPoll,
    VisualizationTitles, VisualizationType,
};

pub use client::CasClient;
pub use poller::{PollPolicy, TaskPoller};

/// Customer Analysis Service 的调用接口
#[async_trait]
pub trait CasApi: Send + Sync {
    async fn submit_search(&self, query: &str, max_count_items: u32) -> GatewayResult<CasTask>;

    async fn submit_pipeline(
        &self,
        product_name_id: &str,
        vis_type: AnalysisVisualizationType,
    ) -> GatewayResult<CasPipeline>;

    async fn submit_product_scrape(&self, product_name_id: &str) -> GatewayResult<CasTask>;

    async fn get_product_info(&self, product_name_id: &str) -> GatewayResult<Option<ProductInfo>>;

    async fn get_task_result(&self, task_id: Uuid) -> GatewayResult<TaskPoll>;

    async fn submit_visualization(
        &self,
        batch: &RecordBatch,
        vis_type: VisualizationType,
        titles: &VisualizationTitles,
    ) -> GatewayResult<CasTask>;
}
