use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use super::models::{
    AnalysisVisualizationType, CasPipeline, CasTask, ProductInfo, RecordBatch, TaskPoll,
    VisualizationTitles, VisualizationType,
};
use super::CasApi;
use crate::config::AppConfig;
use crate::utils::{GatewayError, GatewayResult};

pub const API_KEY_HEADER: &str = "X-API-Key";

/// CAS HTTP 客户端，连接池在客户端生命周期内复用
pub struct CasClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl CasClient {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> GatewayResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Internal(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    pub fn from_config(config: &AppConfig) -> GatewayResult<Self> {
        Self::new(
            &config.cas_api_url(),
            &config.cas.api_key,
            Duration::from_secs(config.cas.request_timeout_secs),
        )
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.client
            .get(self.url(path))
            .header(API_KEY_HEADER, &self.api_key)
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.client
            .post(self.url(path))
            .header(API_KEY_HEADER, &self.api_key)
    }

    /// 发送请求，传输层错误统一转为 Upstream
    async fn send(&self, request: RequestBuilder) -> GatewayResult<Response> {
        request.send().await.map_err(|e| {
            warn!("CAS 请求失败: {}", e);
            GatewayError::Upstream(e.to_string())
        })
    }

    async fn parse<T: DeserializeOwned>(response: Response) -> GatewayResult<T> {
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| GatewayError::Upstream(format!("unexpected CAS payload: {}", e)))
    }

    /// 提交类请求的统一策略：200 解析为任务，其余状态一律报错
    async fn run_task(
        &self,
        request: RequestBuilder,
        what: &str,
        on_reject: fn(String) -> GatewayError,
    ) -> GatewayResult<CasTask> {
        let response = self.send(request).await?;
        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            warn!("CAS {} 返回 {}: {}", what, status, body);
            return Err(on_reject(format!("{} returned {}", what, status)));
        }

        let task: CasTask = Self::parse(response).await?;
        debug!("CAS {} 已提交: task_id={}", what, task.task_id);
        Ok(task)
    }
}

#[async_trait]
impl CasApi for CasClient {
    async fn submit_search(&self, query: &str, max_count_items: u32) -> GatewayResult<CasTask> {
        let request = self.get("scraper/search").query(&[
            ("search_input", query.to_string()),
            ("max_count_items", max_count_items.to_string()),
        ]);
        self.run_task(request, "search", GatewayError::Upstream).await
    }

    async fn submit_pipeline(
        &self,
        product_name_id: &str,
        vis_type: AnalysisVisualizationType,
    ) -> GatewayResult<CasPipeline> {
        let request = self.get("pipeline/shaper/comprehensive_analysis").query(&[
            ("product_name_id", product_name_id),
            ("analysis_vis_type", vis_type.as_str()),
        ]);
        let response = self.send(request).await?;
        let status = response.status();
        if status != StatusCode::OK {
            warn!("CAS 流水线提交失败: {} ({})", status, product_name_id);
            return Err(GatewayError::UpstreamFailure(format!(
                "pipeline returned {}",
                status
            )));
        }

        let pipeline: CasPipeline = Self::parse(response).await?;
        debug!("CAS 流水线已提交: pipeline_id={}", pipeline.pipeline_id);
        Ok(pipeline)
    }

    async fn submit_product_scrape(&self, product_name_id: &str) -> GatewayResult<CasTask> {
        let request = self
            .get("scraper/products_data")
            .query(&[("product_name_id", product_name_id)]);
        self.run_task(request, "product scrape", GatewayError::Upstream)
            .await
    }

    async fn get_product_info(&self, product_name_id: &str) -> GatewayResult<Option<ProductInfo>> {
        let request = self
            .get("product/info")
            .query(&[("product_name_id", product_name_id)]);
        let response = self.send(request).await?;
        if response.status() != StatusCode::OK {
            debug!("产品信息不可用: {} ({})", product_name_id, response.status());
            return Ok(None);
        }
        Ok(Some(Self::parse(response).await?))
    }

    async fn get_task_result(&self, task_id: Uuid) -> GatewayResult<TaskPoll> {
        let request = self.get("result").query(&[("task_id", task_id.to_string())]);
        let response = self.send(request).await?;
        match response.status() {
            StatusCode::OK => Ok(TaskPoll::Ready(response.bytes().await?.to_vec())),
            StatusCode::ACCEPTED => Ok(TaskPoll::Pending),
            status => {
                warn!("CAS 任务结果异常: task_id={}, status={}", task_id, status);
                Err(GatewayError::Upstream(format!(
                    "result of task {} returned {}",
                    task_id, status
                )))
            }
        }
    }

    async fn submit_visualization(
        &self,
        batch: &RecordBatch,
        vis_type: VisualizationType,
        titles: &VisualizationTitles,
    ) -> GatewayResult<CasTask> {
        let kind = batch.kind();
        let mut query = vec![
            ("vis_type", vis_type.as_str().to_string()),
            ("title", titles.title.clone()),
            ("title_object_count", titles.title_object_count.clone()),
        ];
        if kind.takes_analysis_value_title() {
            if let Some(ref value_title) = titles.title_analysis_value {
                query.push(("title_analysis_value", value_title.clone()));
            }
        }

        let request = self
            .post(&format!("visualizer/{}", kind.path()))
            .query(&query)
            .json(batch);
        self.run_task(request, "visualization", GatewayError::UpstreamFailure)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cas::models::{GroupRegionallyAllCustomerAnalysis, VisualizationKind};
    use mockito::Matcher;

    const TASK_ID: &str = "3f1c2d4e-5b6a-4c7d-8e9f-0a1b2c3d4e5f";

    fn client_for(server: &mockito::ServerGuard) -> CasClient {
        CasClient::new(&format!("{}/", server.url()), "secret", Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn search_sends_key_and_parses_task() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/scraper/search")
            .match_header(API_KEY_HEADER, "secret")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("search_input".into(), "ЧелГу".into()),
                Matcher::UrlEncoded("max_count_items".into(), "5".into()),
            ]))
            .with_status(200)
            .with_body(format!(r#"{{"task_id": "{}"}}"#, TASK_ID))
            .create_async()
            .await;

        let task = client_for(&server).submit_search("ЧелГу", 5).await.unwrap();
        assert_eq!(task.task_id.to_string(), TASK_ID);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn search_non_200_is_upstream_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/scraper/search")
            .match_query(Matcher::Any)
            .with_status(500)
            .create_async()
            .await;

        let err = client_for(&server).submit_search("x", 1).await.unwrap_err();
        assert!(matches!(err, GatewayError::Upstream(_)));
        assert_eq!(err.status_code(), 502);
    }

    #[tokio::test]
    async fn pipeline_rejection_is_upstream_failure() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/pipeline/shaper/comprehensive_analysis")
            .match_query(Matcher::UrlEncoded("analysis_vis_type".into(), "all".into()))
            .with_status(400)
            .create_async()
            .await;

        let err = client_for(&server)
            .submit_pipeline("chelgu", AnalysisVisualizationType::All)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamFailure(_)));
    }

    #[tokio::test]
    async fn missing_product_is_none() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/product/info")
            .match_query(Matcher::Any)
            .with_status(404)
            .create_async()
            .await;

        let info = client_for(&server).get_product_info("nope").await.unwrap();
        assert!(info.is_none());
    }

    #[tokio::test]
    async fn task_result_distinguishes_pending_ready_and_error() {
        let mut server = mockito::Server::new_async().await;
        let task_id: Uuid = TASK_ID.parse().unwrap();
        let client = client_for(&server);

        let pending = server
            .mock("GET", "/result")
            .match_query(Matcher::UrlEncoded("task_id".into(), TASK_ID.into()))
            .with_status(202)
            .create_async()
            .await;
        assert_eq!(client.get_task_result(task_id).await.unwrap(), TaskPoll::Pending);
        pending.remove_async().await;

        let ready = server
            .mock("GET", "/result")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"x":1}"#)
            .create_async()
            .await;
        assert_eq!(
            client.get_task_result(task_id).await.unwrap(),
            TaskPoll::Ready(br#"{"x":1}"#.to_vec())
        );
        ready.remove_async().await;

        server
            .mock("GET", "/result")
            .match_query(Matcher::Any)
            .with_status(500)
            .create_async()
            .await;
        assert!(matches!(
            client.get_task_result(task_id).await,
            Err(GatewayError::Upstream(_))
        ));
    }

    #[tokio::test]
    async fn visualization_posts_records_to_kind_path() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/visualizer/analysis_value/region")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("vis_type".into(), "png".into()),
                Matcher::UrlEncoded("title".into(), "Regions".into()),
                Matcher::UrlEncoded("title_analysis_value".into(), "Mood".into()),
            ]))
            .match_body(Matcher::PartialJsonString(
                r#"[{"region": "Chelyabinsk", "count": 3}]"#.to_string(),
            ))
            .with_status(200)
            .with_body(format!(r#"{{"task_id": "{}"}}"#, TASK_ID))
            .create_async()
            .await;

        let batch = RecordBatch::AnalysisValueRegion(vec![GroupRegionallyAllCustomerAnalysis {
            region: "Chelyabinsk".into(),
            count: 3,
            analysis_value: 0.25,
        }]);
        assert_eq!(batch.kind(), VisualizationKind::AnalysisValueRegion);
        let titles = VisualizationTitles {
            title: "Regions".into(),
            title_object_count: "Customers".into(),
            title_analysis_value: Some("Mood".into()),
        };

        let task = client_for(&server)
            .submit_visualization(&batch, VisualizationType::Png, &titles)
            .await
            .unwrap();
        assert_eq!(task.task_id.to_string(), TASK_ID);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn transport_failure_is_upstream_error() {
        // 端口 9 (discard) 上没有服务
        let client = CasClient::new("http://127.0.0.1:9/", "k", Duration::from_secs(2)).unwrap();
        let err = client.submit_search("x", 1).await.unwrap_err();
        assert!(matches!(err, GatewayError::Upstream(_)));
    }
}
