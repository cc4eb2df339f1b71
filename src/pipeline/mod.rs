pub mod relay;

use serde::Serialize;
use serde_json::json;
use std::fmt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cas::models::{AnalysisType, AnalysisVisualizationType, PipelineComponent};
use crate::cas::{CasApi, PollPolicy, TaskPoller};
use crate::storage::models::{AccessType, NewReport, User};
use crate::storage::Database;
use crate::utils::{GatewayError, GatewayResult};

pub use relay::{Frame, ResultEncoding, StatusSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Pending,
    Started,
    ProductResolved,
    ReportCreated,
    StageIterating,
    Completed,
    Failed,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Pending => "pending",
            PipelineState::Started => "started",
            PipelineState::ProductResolved => "product_resolved",
            PipelineState::ReportCreated => "report_created",
            PipelineState::StageIterating => "stage_iterating",
            PipelineState::Completed => "completed",
            PipelineState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// 单次流水线运行的状态跟踪
struct PipelineRun {
    pipeline_id: Option<Uuid>,
    state: PipelineState,
}

impl PipelineRun {
    fn new(pipeline_id: Option<Uuid>) -> Self {
        Self {
            pipeline_id,
            state: PipelineState::Pending,
        }
    }

    fn advance(&mut self, next: PipelineState) {
        debug!(pipeline_id = ?self.pipeline_id, from = %self.state, to = %next, "流水线状态变更");
        self.state = next;
    }

    fn fail(&mut self, error: &GatewayError) {
        warn!(pipeline_id = ?self.pipeline_id, state = %self.state, "流水线失败: {}", error);
        self.state = PipelineState::Failed;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutcome {
    pub pipeline_id: Uuid,
    pub report_id: String,
    pub stages_saved: Vec<AnalysisType>,
}

pub struct PipelineOrchestrator<'a> {
    cas: &'a dyn CasApi,
    db: &'a Database,
    policy: PollPolicy,
}

impl<'a> PipelineOrchestrator<'a> {
    pub fn new(cas: &'a dyn CasApi, db: &'a Database, policy: PollPolicy) -> Self {
        Self { cas, db, policy }
    }

    /// 完整流程：提交流水线 → 产品信息 → 创建报告 → 逐阶段保存
    pub async fn run(
        &self,
        caller: &User,
        product_name_id: &str,
        vis_type: AnalysisVisualizationType,
        sink: &mut dyn StatusSink,
    ) -> GatewayResult<PipelineOutcome> {
        let mut run = PipelineRun::new(None);
        let result = self
            .run_inner(&mut run, caller, product_name_id, vis_type, sink)
            .await;
        if let Err(ref e) = result {
            run.fail(e);
        }
        result
    }

    async fn run_inner(
        &self,
        run: &mut PipelineRun,
        caller: &User,
        product_name_id: &str,
        vis_type: AnalysisVisualizationType,
        sink: &mut dyn StatusSink,
    ) -> GatewayResult<PipelineOutcome> {
        let pipeline = self.cas.submit_pipeline(product_name_id, vis_type).await?;
        run.pipeline_id = Some(pipeline.pipeline_id);
        run.advance(PipelineState::Started);
        sink.send(Frame::json(&json!({ "pipeline_id": pipeline.pipeline_id }))?)
            .await?;

        let product = self
            .cas
            .get_product_info(product_name_id)
            .await?
            .ok_or_else(|| GatewayError::ProductNotFound(product_name_id.to_string()))?;
        run.advance(PipelineState::ProductResolved);

        let report = self
            .db
            .create_report(&NewReport {
                id: pipeline.pipeline_id.to_string(),
                owner_id: caller.id,
                access_type: AccessType::BotUsers,
                product_name_id: product.name_id,
                product_image_url: product.image_url,
                title: product.fullname,
            })
            .await?;
        self.db
            .log_action(None, caller.id, &format!("Created analysis report {}", report.id))
            .await?;
        run.advance(PipelineState::ReportCreated);
        sink.send(Frame::json(&json!({ "report_id": report.id }))?)
            .await?;

        let stages_saved = self
            .iterate_stages(run, caller, pipeline.pipeline_id, &report.id, sink)
            .await?;
        self.complete(run, pipeline.pipeline_id, report.id, stages_saved, sink)
            .await
    }

    /// 只执行阶段保存，报告必须已存在且属于调用者
    pub async fn save_report(
        &self,
        caller: &User,
        pipeline_id: Uuid,
        sink: &mut dyn StatusSink,
    ) -> GatewayResult<PipelineOutcome> {
        let mut run = PipelineRun::new(Some(pipeline_id));
        let result = self.save_inner(&mut run, caller, pipeline_id, sink).await;
        if let Err(ref e) = result {
            run.fail(e);
        }
        result
    }

    async fn save_inner(
        &self,
        run: &mut PipelineRun,
        caller: &User,
        pipeline_id: Uuid,
        sink: &mut dyn StatusSink,
    ) -> GatewayResult<PipelineOutcome> {
        let report_id = pipeline_id.to_string();
        let report = self
            .db
            .get_report(&report_id)
            .await?
            .filter(|r| r.is_exist)
            .ok_or(GatewayError::ReportNotFound)?;
        if report.owner_id != caller.id {
            return Err(GatewayError::NotOwner);
        }
        run.advance(PipelineState::ReportCreated);

        let stages_saved = self
            .iterate_stages(run, caller, pipeline_id, &report_id, sink)
            .await?;
        self.complete(run, pipeline_id, report_id, stages_saved, sink)
            .await
    }

    async fn iterate_stages(
        &self,
        run: &mut PipelineRun,
        caller: &User,
        pipeline_id: Uuid,
        report_id: &str,
        sink: &mut dyn StatusSink,
    ) -> GatewayResult<Vec<AnalysisType>> {
        run.advance(PipelineState::StageIterating);
        let poller = TaskPoller::new(self.cas, self.policy);

        let raw = poller.resolve(pipeline_id).await?;
        let components: Vec<PipelineComponent> = serde_json::from_slice(&raw)
            .map_err(|e| GatewayError::Upstream(format!("malformed pipeline components: {}", e)))?;
        info!(%pipeline_id, "流水线共 {} 个阶段", components.len());
        sink.send(Frame::json(&json!({ "components": &components }))?)
            .await?;

        let mut saved = Vec::with_capacity(components.len());
        for (index, component) in components.iter().enumerate() {
            let analysis_type = component.analysis_type;
            let json = self.resolve_stage(&poller, component).await?;

            let written = self
                .db
                .write_report_slot(report_id, caller.id, analysis_type, &json)
                .await?;
            if written {
                saved.push(analysis_type);
                info!(%pipeline_id, %analysis_type, "阶段数据已保存");
            }

            let status = if written { "saved" } else { "skipped" };
            sink.send(Frame::json(&json!({
                "stage": index,
                "analysis_type": analysis_type,
                "status": status,
            }))?)
            .await?;
        }
        Ok(saved)
    }

    /// 阶段数据必须解析为合法 JSON 才算完成
    async fn resolve_stage(
        &self,
        poller: &TaskPoller<'_>,
        component: &PipelineComponent,
    ) -> GatewayResult<String> {
        let analysis_type = component.analysis_type;
        let task_id = component.analysis_task_id.ok_or_else(|| {
            GatewayError::StageDataMissing(format!("{} has no analysis task", analysis_type))
        })?;

        let bytes = match poller.resolve(task_id).await {
            Ok(bytes) => bytes,
            Err(GatewayError::Timeout(_)) => {
                return Err(GatewayError::StageDataMissing(format!(
                    "{} never became ready",
                    analysis_type
                )))
            }
            Err(e) => return Err(e),
        };

        String::from_utf8(bytes)
            .ok()
            .filter(|text| serde_json::from_str::<serde_json::Value>(text).is_ok())
            .ok_or_else(|| {
                GatewayError::StageDataMissing(format!("{} is not valid JSON", analysis_type))
            })
    }

    async fn complete(
        &self,
        run: &mut PipelineRun,
        pipeline_id: Uuid,
        report_id: String,
        stages_saved: Vec<AnalysisType>,
        sink: &mut dyn StatusSink,
    ) -> GatewayResult<PipelineOutcome> {
        run.advance(PipelineState::Completed);
        let outcome = PipelineOutcome {
            pipeline_id,
            report_id,
            stages_saved,
        };
        sink.send(Frame::json(&json!({
            "status": "completed",
            "report_id": &outcome.report_id,
            "stages_saved": &outcome.stages_saved,
        }))?)
        .await?;
        Ok(outcome)
    }
}
