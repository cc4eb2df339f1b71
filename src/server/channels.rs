//! 流式通道：每个操作一个 WebSocket 端点
//!
//! 操作本身写入 `mpsc` 帧队列，连接循环负责转发帧并监听客户端。
//! 客户端关闭连接时操作 future 被直接丢弃，轮询随之中止，也不会扣 token。
//! 参数错误不会在升级前以 HTTP 400 拒绝，而是升级后以 4422 关闭。

use axum::{
    extract::{
        rejection::{PathRejection, QueryRejection},
        ws::{close_code, CloseFrame, Message, WebSocketUpgrade},
        Path, Query, State,
    },
    http::HeaderMap,
    response::Response,
    routing::get,
    Router,
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::borrow::Cow;
use std::fmt;
use std::future::Future;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{validated, AppState};
use crate::access::AccessGuard;
use crate::cas::models::{
    AnalysisVisualizationType, RecordBatch, VisualizationKind, VisualizationTitles,
    VisualizationType,
};
use crate::cas::TaskPoller;
use crate::pipeline::{Frame, PipelineOrchestrator, ResultEncoding, StatusSink};
use crate::storage::models::{Role, User};
use crate::utils::{GatewayError, GatewayResult};

const FRAME_BUFFER: usize = 16;

/// WebSocket 关闭原因最长 123 字节
const MAX_CLOSE_REASON: usize = 123;

const ERROR_CLOSE_BASE: u16 = 4000;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/analysis/search", get(search_handler))
        .route("/analysis/task_result", get(task_result_handler))
        .route("/analysis/pipeline_analysis", get(pipeline_handler))
        .route("/analysis/save_report", get(save_report_handler))
        .route("/analysis/visualize/:kind", get(visualize_handler))
        .route("/analysis/collect", get(collect_handler))
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub search_input: String,
    pub max_count_items: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct TaskResultQuery {
    pub task_id: Uuid,
    #[serde(default)]
    pub binary: bool,
}

#[derive(Debug, Deserialize)]
pub struct PipelineQuery {
    pub product_name_id: String,
    #[serde(default)]
    pub analysis_vis_type: AnalysisVisualizationType,
}

#[derive(Debug, Deserialize)]
pub struct SaveReportQuery {
    pub pipeline_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct VisualizeQuery {
    pub vis_type: VisualizationType,
    pub title: String,
    pub title_object_count: String,
    pub title_analysis_value: Option<String>,
}

/// 路径中的图表种类、查询参数和客户端发来的记录数组
#[derive(Debug)]
pub struct VisualizeRequest {
    pub kind: VisualizationKind,
    pub query: VisualizeQuery,
    pub payload: String,
}

#[derive(Debug, Deserialize)]
pub struct CollectQuery {
    pub product_name_id: String,
}

async fn search_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    query: Result<Query<SearchQuery>, QueryRejection>,
) -> Response {
    let params = validated(query).map(|Query(q)| q);
    ws.on_upgrade(move |socket| {
        let (ws_tx, ws_rx) = socket.split();
        run_session(ws_tx, ws_rx, state, headers, "search", params, search)
    })
}

async fn task_result_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    query: Result<Query<TaskResultQuery>, QueryRejection>,
) -> Response {
    let params = validated(query).map(|Query(q)| q);
    ws.on_upgrade(move |socket| {
        let (ws_tx, ws_rx) = socket.split();
        run_session(ws_tx, ws_rx, state, headers, "task_result", params, task_result)
    })
}

async fn pipeline_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    query: Result<Query<PipelineQuery>, QueryRejection>,
) -> Response {
    let params = validated(query).map(|Query(q)| q);
    ws.on_upgrade(move |socket| {
        let (ws_tx, ws_rx) = socket.split();
        run_session(ws_tx, ws_rx, state, headers, "pipeline_analysis", params, pipeline_analysis)
    })
}

async fn save_report_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    query: Result<Query<SaveReportQuery>, QueryRejection>,
) -> Response {
    let params = validated(query).map(|Query(q)| q);
    ws.on_upgrade(move |socket| {
        let (ws_tx, ws_rx) = socket.split();
        run_session(ws_tx, ws_rx, state, headers, "save_report", params, save_report)
    })
}

async fn visualize_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    kind: Result<Path<VisualizationKind>, PathRejection>,
    query: Result<Query<VisualizeQuery>, QueryRejection>,
) -> Response {
    let params = validated(kind).and_then(|Path(kind)| validated(query).map(|Query(q)| (kind, q)));
    ws.on_upgrade(move |socket| async move {
        let (ws_tx, mut ws_rx) = socket.split();
        // 参数合法时客户端先发送一份 JSON 记录数组
        let request = match params {
            Ok((kind, query)) => match read_payload(&mut ws_rx).await {
                Some(payload) => payload.map(|payload| VisualizeRequest {
                    kind,
                    query,
                    payload,
                }),
                None => {
                    debug!("visualize: 客户端未发送数据即断开");
                    return;
                }
            },
            Err(e) => Err(e),
        };
        run_session(ws_tx, ws_rx, state, headers, "visualize", request, visualize).await
    })
}

async fn collect_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    query: Result<Query<CollectQuery>, QueryRejection>,
) -> Response {
    let params = validated(query).map(|Query(q)| q);
    ws.on_upgrade(move |socket| {
        let (ws_tx, ws_rx) = socket.split();
        run_session(ws_tx, ws_rx, state, headers, "collect", params, collect)
    })
}

// ---------- 操作 ----------

pub async fn search<S: StatusSink>(
    state: AppState,
    caller: Option<User>,
    query: SearchQuery,
    mut sink: S,
) -> GatewayResult<()> {
    let guard = AccessGuard::new(Role::User).with_cost(state.config.costs.search);
    let max_items = query
        .max_count_items
        .unwrap_or(state.config.cas.search_max_items);

    guard
        .run(&state.db, caller.as_ref(), async {
            let task = state.cas.submit_search(&query.search_input, max_items).await?;
            let poller = TaskPoller::new(state.cas.as_ref(), state.poll_policy());
            let bytes = poller.resolve(task.task_id).await?;
            sink.send(ResultEncoding::Text.encode(bytes)?).await
        })
        .await
}

pub async fn task_result<S: StatusSink>(
    state: AppState,
    caller: Option<User>,
    query: TaskResultQuery,
    mut sink: S,
) -> GatewayResult<()> {
    let guard = AccessGuard::new(Role::User).with_cost(state.config.costs.task_result);
    let encoding = if query.binary {
        ResultEncoding::Binary
    } else {
        ResultEncoding::Text
    };

    guard
        .run(&state.db, caller.as_ref(), async {
            let poller = TaskPoller::new(state.cas.as_ref(), state.poll_policy());
            let bytes = poller.resolve(query.task_id).await?;
            sink.send(encoding.encode(bytes)?).await
        })
        .await
}

pub async fn pipeline_analysis<S: StatusSink>(
    state: AppState,
    caller: Option<User>,
    query: PipelineQuery,
    mut sink: S,
) -> GatewayResult<()> {
    let guard = AccessGuard::new(Role::User).with_cost(state.config.costs.pipeline);
    let user = guard.admit(caller.as_ref())?;
    let orchestrator =
        PipelineOrchestrator::new(state.cas.as_ref(), &state.db, state.poll_policy());

    let outcome = guard
        .run(
            &state.db,
            caller.as_ref(),
            orchestrator.run(user, &query.product_name_id, query.analysis_vis_type, &mut sink),
        )
        .await?;
    info!(
        user_id = user.id,
        pipeline_id = %outcome.pipeline_id,
        "流水线完成，保存 {} 个阶段",
        outcome.stages_saved.len()
    );
    Ok(())
}

pub async fn save_report<S: StatusSink>(
    state: AppState,
    caller: Option<User>,
    query: SaveReportQuery,
    mut sink: S,
) -> GatewayResult<()> {
    let guard = AccessGuard::new(Role::User).with_cost(state.config.costs.save_report);
    let user = guard.admit(caller.as_ref())?;
    let orchestrator =
        PipelineOrchestrator::new(state.cas.as_ref(), &state.db, state.poll_policy());

    guard
        .run(
            &state.db,
            caller.as_ref(),
            orchestrator.save_report(user, query.pipeline_id, &mut sink),
        )
        .await?;
    Ok(())
}

pub async fn visualize<S: StatusSink>(
    state: AppState,
    caller: Option<User>,
    request: VisualizeRequest,
    mut sink: S,
) -> GatewayResult<()> {
    let VisualizeRequest {
        kind,
        query,
        payload,
    } = request;
    let guard = AccessGuard::new(Role::User).with_cost(state.config.costs.visualize);
    let encoding = if query.vis_type.is_binary() {
        ResultEncoding::Binary
    } else {
        ResultEncoding::Text
    };

    guard
        .run(&state.db, caller.as_ref(), async {
            if kind.takes_analysis_value_title() && query.title_analysis_value.is_none() {
                return Err(GatewayError::Validation(
                    "title_analysis_value is required for this visualization".to_string(),
                ));
            }
            let batch = RecordBatch::parse(kind, &payload)?;
            let titles = VisualizationTitles {
                title: query.title.clone(),
                title_object_count: query.title_object_count.clone(),
                title_analysis_value: query.title_analysis_value.clone(),
            };

            let task = state
                .cas
                .submit_visualization(&batch, query.vis_type, &titles)
                .await?;
            debug!(task_id = %task.task_id, records = batch.len(), "可视化任务已提交");

            let poller = TaskPoller::new(state.cas.as_ref(), state.poll_policy());
            let bytes = poller.resolve(task.task_id).await?;
            sink.send(encoding.encode(bytes)?).await
        })
        .await
}

pub async fn collect<S: StatusSink>(
    state: AppState,
    caller: Option<User>,
    query: CollectQuery,
    mut sink: S,
) -> GatewayResult<()> {
    let guard = AccessGuard::new(Role::Manager).with_cost(state.config.costs.collect);

    guard
        .run(&state.db, caller.as_ref(), async {
            let task = state.cas.submit_product_scrape(&query.product_name_id).await?;
            sink.send(Frame::json(&json!({ "task_id": task.task_id }))?)
                .await?;
            let poller = TaskPoller::new(state.cas.as_ref(), state.poll_policy());
            let bytes = poller.resolve(task.task_id).await?;
            sink.send(ResultEncoding::Text.encode(bytes)?).await
        })
        .await
}

// ---------- 连接驱动 ----------

/// 读取客户端的第一条数据消息；客户端关闭或出错时返回 None
async fn read_payload<R, E>(ws_rx: &mut R) -> Option<GatewayResult<String>>
where
    R: Stream<Item = Result<Message, E>> + Unpin,
{
    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => return Some(Ok(text)),
            Ok(Message::Binary(bytes)) => {
                return Some(String::from_utf8(bytes).map_err(|_| {
                    GatewayError::Validation("payload is not valid UTF-8".to_string())
                }))
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(Message::Close(_)) | Err(_) => return None,
        }
    }
    None
}

/// 校验参数、解析调用者，然后驱动操作直至完成或客户端离开
async fn run_session<Tx, Rx, E, P, F, Fut>(
    ws_tx: Tx,
    ws_rx: Rx,
    state: AppState,
    headers: HeaderMap,
    channel: &'static str,
    params: GatewayResult<P>,
    op: F,
) where
    Tx: Sink<Message> + Unpin,
    Tx::Error: fmt::Display,
    Rx: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
    F: FnOnce(AppState, Option<User>, P, mpsc::Sender<Frame>) -> Fut,
    Fut: Future<Output = GatewayResult<()>>,
{
    let (tx, rx) = mpsc::channel(FRAME_BUFFER);
    let session = async move {
        let params = params?;
        let caller = state.caller(&headers).await?;
        op(state, caller, params, tx).await
    };
    drive(ws_tx, ws_rx, rx, session, channel).await;
}

async fn drive<Tx, Rx, E, Fut>(
    mut ws_tx: Tx,
    mut ws_rx: Rx,
    mut frames: mpsc::Receiver<Frame>,
    op: Fut,
    channel: &'static str,
) where
    Tx: Sink<Message> + Unpin,
    Tx::Error: fmt::Display,
    Rx: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
    Fut: Future<Output = GatewayResult<()>>,
{
    tokio::pin!(op);

    let result = loop {
        tokio::select! {
            biased;

            Some(frame) = frames.recv() => {
                if let Err(e) = ws_tx.send(into_message(frame)).await {
                    warn!(channel, "发送帧失败: {}", e);
                    return;
                }
            }

            result = &mut op => break result,

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => {
                        info!(channel, "客户端关闭连接，操作已取消");
                        return;
                    }
                    Some(Err(e)) => {
                        warn!(channel, "WebSocket 错误，操作已取消: {}", e);
                        return;
                    }
                    _ => {}
                }
            }
        }
    };

    // 操作结束后把残留的帧发完
    while let Ok(frame) = frames.try_recv() {
        if ws_tx.send(into_message(frame)).await.is_err() {
            return;
        }
    }

    if let Err(ref e) = result {
        if e.status_code() >= 500 {
            warn!(channel, "操作失败: {}", e);
        } else {
            debug!(channel, "操作被拒绝: {}", e);
        }
    }
    let close = Message::Close(Some(close_frame(&result)));
    if let Err(e) = ws_tx.send(close).await {
        debug!(channel, "发送关闭帧失败: {}", e);
    }
}

fn into_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text),
        Frame::Binary(bytes) => Message::Binary(bytes),
    }
}

/// 成功以 1000 关闭，失败以 4000 + 状态码关闭
fn close_frame(result: &GatewayResult<()>) -> CloseFrame<'static> {
    match result {
        Ok(()) => CloseFrame {
            code: close_code::NORMAL,
            reason: Cow::Borrowed(""),
        },
        Err(e) => CloseFrame {
            code: ERROR_CLOSE_BASE + e.status_code(),
            reason: Cow::Owned(truncate_reason(&e.public_message())),
        },
    }
}

fn truncate_reason(message: &str) -> String {
    let mut end = message.len().min(MAX_CLOSE_REASON);
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}
