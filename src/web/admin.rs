use crate::error::RelayError;
use crate::registry::{Registry, SourceModel};
use crate::state::SharedState;
use crate::store::SourceRecord;
use axum::{
    extract::{Query, State},
    Form, Json,
};
use serde::Deserialize;

/// /streamer/add 的参数; GET 查询串与表单均可
#[derive(Debug, Deserialize)]
pub struct AddParams {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub resolution: String,
    #[serde(default)]
    pub lazy: bool,
}

#[derive(Debug, Deserialize)]
pub struct KeyParams {
    #[serde(default)]
    pub key: String,
}

pub async fn add_source(
    State(state): State<SharedState>,
    Query(params): Query<AddParams>,
) -> String {
    add_inner(&state, params).await
}

pub async fn add_source_form(
    State(state): State<SharedState>,
    Form(params): Form<AddParams>,
) -> String {
    add_inner(&state, params).await
}

/// 新建源; 返回与管理端约定的纯文本令牌
async fn add_inner(state: &SharedState, params: AddParams) -> String {
    let key = params.key.trim().to_string();
    let source = params.source.trim().to_string();
    let resolution = params.resolution.trim().to_string();

    if key.is_empty() {
        return "key required".to_string();
    }
    if source.is_empty() {
        return "source required".to_string();
    }

    let record = SourceRecord {
        key,
        source,
        resolution: if resolution.is_empty() {
            None
        } else {
            Some(resolution)
        },
        lazy: params.lazy,
    };

    match Registry::create(state, record).await {
        Ok(()) => "ok".to_string(),
        Err(RelayError::DuplicateKey(_)) => "same key".to_string(),
        Err(e) => e.to_string(),
    }
}

/// 获取源列表 API
pub async fn list_sources(State(state): State<SharedState>) -> Json<Vec<SourceModel>> {
    Json(Registry::list(&state))
}

pub async fn delete_source(
    State(state): State<SharedState>,
    Query(params): Query<KeyParams>,
) -> String {
    delete_inner(&state, params).await
}

pub async fn delete_source_form(
    State(state): State<SharedState>,
    Form(params): Form<KeyParams>,
) -> String {
    delete_inner(&state, params).await
}

/// 删除源; 对未知 key 同样返回 ok
async fn delete_inner(state: &SharedState, params: KeyParams) -> String {
    match Registry::delete(state, params.key.trim()).await {
        Ok(()) => "ok".to_string(),
        Err(e) => e.to_string(),
    }
}

/// 获取系统状态 API (内存与负载)
pub async fn sys_status() -> Json<serde_json::Value> {
    let mem = sys_info::mem_info()
        .map(|m| (m.total, m.avail))
        .unwrap_or((0, 0));
    let load = sys_info::loadavg().map(|l| l.one).unwrap_or(0.0);

    Json(serde_json::json!({
        "mem_total": mem.0 / 1024, // 转换为MB
        "mem_avail": mem.1 / 1024, // 转换为MB
        "load_avg": load,
    }))
}
