//! 测试用的 CAS 假实现与数据库种子数据

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use uuid::Uuid;

use crate::cas::models::{
    AnalysisVisualizationType, CasPipeline, CasTask, ProductInfo, RecordBatch, TaskPoll,
    VisualizationTitles, VisualizationType,
};
use crate::cas::CasApi;
use crate::storage::models::{AccessType, NewReport, NewUser, Role, User};
use crate::storage::Database;
use crate::utils::{GatewayError, GatewayResult};

/// 按脚本回放结果的 CAS，脚本耗尽后返回 Upstream 错误
#[derive(Default)]
pub struct FakeCas {
    results: Mutex<HashMap<Uuid, VecDeque<TaskPoll>>>,
    calls: Mutex<HashMap<Uuid, u32>>,
    products: Mutex<HashMap<String, ProductInfo>>,
    pipeline_id: Mutex<Option<Uuid>>,
    submitted_tasks: Mutex<Vec<Uuid>>,
}

impl FakeCas {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, task_id: Uuid, polls: Vec<TaskPoll>) {
        self.results.lock().unwrap().insert(task_id, polls.into());
    }

    pub fn ready(&self, task_id: Uuid, body: &str) {
        self.script(task_id, vec![TaskPoll::Ready(body.as_bytes().to_vec())]);
    }

    pub fn add_product(&self, name_id: &str) {
        self.products.lock().unwrap().insert(
            name_id.to_string(),
            ProductInfo {
                name_id: name_id.to_string(),
                fullname: format!("{} (full name)", name_id),
                image_url: format!("https://img.example/{}.png", name_id),
            },
        );
    }

    pub fn set_pipeline(&self, pipeline_id: Uuid) {
        *self.pipeline_id.lock().unwrap() = Some(pipeline_id);
    }

    /// 之后提交的任务都使用这个 id
    pub fn queue_task(&self, task_id: Uuid) {
        self.submitted_tasks.lock().unwrap().push(task_id);
    }

    pub fn result_calls(&self, task_id: Uuid) -> u32 {
        self.calls.lock().unwrap().get(&task_id).copied().unwrap_or(0)
    }

    fn next_task(&self) -> GatewayResult<CasTask> {
        let mut tasks = self.submitted_tasks.lock().unwrap();
        if tasks.is_empty() {
            return Err(GatewayError::Upstream("no task queued".to_string()));
        }
        Ok(CasTask {
            task_id: tasks.remove(0),
        })
    }
}

#[async_trait]
impl CasApi for FakeCas {
    async fn submit_search(&self, _query: &str, _max: u32) -> GatewayResult<CasTask> {
        self.next_task()
    }

    async fn submit_pipeline(
        &self,
        _product_name_id: &str,
        _vis_type: AnalysisVisualizationType,
    ) -> GatewayResult<CasPipeline> {
        self.pipeline_id
            .lock()
            .unwrap()
            .map(|pipeline_id| CasPipeline { pipeline_id })
            .ok_or_else(|| GatewayError::UpstreamFailure("pipeline returned 500".to_string()))
    }

    async fn submit_product_scrape(&self, _product_name_id: &str) -> GatewayResult<CasTask> {
        self.next_task()
    }

    async fn get_product_info(&self, product_name_id: &str) -> GatewayResult<Option<ProductInfo>> {
        Ok(self.products.lock().unwrap().get(product_name_id).cloned())
    }

    async fn get_task_result(&self, task_id: Uuid) -> GatewayResult<TaskPoll> {
        *self.calls.lock().unwrap().entry(task_id).or_default() += 1;
        self.results
            .lock()
            .unwrap()
            .get_mut(&task_id)
            .and_then(|polls| polls.pop_front())
            .ok_or_else(|| GatewayError::Upstream(format!("unknown task {}", task_id)))
    }

    async fn submit_visualization(
        &self,
        _batch: &RecordBatch,
        _vis_type: VisualizationType,
        _titles: &VisualizationTitles,
    ) -> GatewayResult<CasTask> {
        self.next_task()
    }
}

pub async fn seed_user(db: &Database, id: i64, role: Role, tokens: i64) -> User {
    let user = NewUser {
        id,
        first_name: format!("user{}", id),
        last_name: None,
        username: None,
    };
    db.create_user(&user, tokens).await.unwrap();
    db.set_role(id, role).await.unwrap()
}

pub fn new_report(id: &str, owner_id: i64) -> NewReport {
    NewReport {
        id: id.to_string(),
        owner_id,
        access_type: AccessType::BotUsers,
        product_name_id: "chelgu".to_string(),
        product_image_url: "https://img.example/chelgu.png".to_string(),
        title: "ЧелГУ".to_string(),
    }
}
