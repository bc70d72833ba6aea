//! The HTTP surface peers and UIs talk to: `/metrics/find/` and
//! `/render/`. `local=1` restricts a request to this daemon's own tree,
//! which is what peers set when federating so queries never loop.

use std::{
    sync::Arc,
    time::{
        SystemTime,
        UNIX_EPOCH,
    },
};

use axum::{
    extract::{
        Query,
        State,
    },
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use serde::Deserialize;
use serde_json::json;

use crate::{
    find::FindQuery,
    node::Node,
    remote::{
        RemoteNodeDescriptor,
        RemoteSeries,
    },
    store::Store,
};

#[derive(Clone)]
pub struct HttpState {
    /// Federating store: local tree plus remote peers.
    pub store: Arc<Store>,
    /// Local tree only, used when a request carries `local=1`.
    pub local_store: Arc<Store>,
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/metrics/find/", get(find_view))
        .route("/render/", get(render_view))
        .with_state(state)
}

type ViewError = (StatusCode, String);

fn bad_request(message: &str) -> ViewError {
    (StatusCode::BAD_REQUEST, message.to_owned())
}

#[derive(Deserialize)]
struct FindParams {
    query: Option<String>,
    format: Option<String>,
    local: Option<u8>,
    wildcards: Option<u8>,
    from: Option<i64>,
    until: Option<i64>,
}

async fn find_view(
    State(state): State<HttpState>,
    Query(params): Query<FindParams>,
) -> Result<Json<serde_json::Value>, ViewError> {
    let Some(pattern) = params.query else {
        return Err(bad_request("Missing required parameter 'query'"));
    };
    // -1 is the wire's "unset" for time bounds.
    let from = params.from.filter(|&t| t != -1).map(|t| t as f64);
    let until = params.until.filter(|&t| t != -1).map(|t| t as f64);
    let query =
        FindQuery::new(pattern.clone(), from, until).map_err(|e| bad_request(&e.to_string()))?;

    let store = if params.local == Some(1) {
        &state.local_store
    } else {
        &state.store
    };
    let mut matches = store.find(&query).await;
    matches.sort_by(|a, b| a.name().cmp(b.name()));
    tracing::info!(
        "FindRequest: query={pattern} from={from:?} until={until:?}, found {} matches",
        matches.len(),
    );

    let base_path = match pattern.rsplit_once('.') {
        Some((head, _)) => format!("{head}."),
        None => String::new(),
    };
    match params.format.as_deref().unwrap_or("treejson") {
        "json" => Ok(Json(json!(descriptors(&matches)))),
        "treejson" => Ok(Json(tree_json(
            &matches,
            &base_path,
            params.wildcards == Some(1),
        ))),
        "completer" => {
            // A single branch matched by `foo*` auto-completes to its
            // children.
            let expanded;
            let mut matches = &matches;
            if matches.len() == 1
                && !matches[0].is_leaf()
                && pattern == format!("{}*", matches[0].path())
            {
                let child_query = FindQuery::new(format!("{pattern}.*"), from, until)
                    .map_err(|e| bad_request(&e.to_string()))?;
                expanded = store.find(&child_query).await;
                matches = &expanded;
            }
            let metrics: Vec<serde_json::Value> = matches
                .iter()
                .map(|node| json!({ "path": node.path(), "name": node.name() }))
                .collect();
            Ok(Json(json!({ "metrics": metrics })))
        },
        _ => Err(bad_request("Invalid value for 'format' parameter")),
    }
}

fn descriptors(nodes: &[Node]) -> Vec<RemoteNodeDescriptor> {
    nodes
        .iter()
        .map(|node| RemoteNodeDescriptor {
            path: node.path().to_owned(),
            is_leaf: node.is_leaf(),
            intervals: match node {
                Node::Leaf(leaf) => leaf
                    .intervals()
                    .iter()
                    .map(|i| (i.start(), i.end()))
                    .collect(),
                Node::Branch(_) => Vec::new(),
            },
        })
        .collect()
}

fn tree_entry(text: &str, id: String, is_leaf: bool) -> serde_json::Value {
    json!({
        "text": text,
        "id": id,
        "allowChildren": if is_leaf { 0 } else { 1 },
        "expandable": if is_leaf { 0 } else { 1 },
        "leaf": if is_leaf { 1 } else { 0 },
    })
}

fn tree_json(nodes: &[Node], base_path: &str, wildcards: bool) -> serde_json::Value {
    let mut results = Vec::new();
    // A wildcard pseudo-node when the pattern matched several children.
    if nodes.len() > 1 && wildcards {
        let all_leaves = nodes.iter().all(Node::is_leaf);
        results.push(tree_entry("*", format!("{base_path}*"), all_leaves));
    }
    let mut found = std::collections::HashSet::new();
    for node in nodes {
        if !found.insert(node.name()) {
            continue;
        }
        results.push(tree_entry(
            node.name(),
            format!("{base_path}{}", node.name()),
            node.is_leaf(),
        ));
    }
    json!(results)
}

#[derive(Deserialize)]
struct RenderParams {
    target: Option<String>,
    local: Option<u8>,
    from: Option<i64>,
    until: Option<i64>,
}

async fn render_view(
    State(state): State<HttpState>,
    Query(params): Query<RenderParams>,
) -> Result<Json<Vec<RemoteSeries>>, ViewError> {
    let Some(target) = params.target else {
        return Err(bad_request("Missing required parameter 'target'"));
    };
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let from = params.from.unwrap_or(now - 24 * 60 * 60);
    let until = params.until.unwrap_or(now);
    let query = FindQuery::new(target, Some(from as f64), Some(until as f64))
        .map_err(|e| bad_request(&e.to_string()))?;

    let store = if params.local == Some(1) {
        &state.local_store
    } else {
        &state.store
    };
    let mut series_list = Vec::new();
    for node in store.find(&query).await {
        let Node::Leaf(leaf) = node else {
            continue;
        };
        match leaf.fetch(from as f64, until as f64).await {
            Ok(data) => series_list.push(RemoteSeries {
                name: leaf.path.clone(),
                start: data.time_info.start,
                end: data.time_info.end,
                step: data.time_info.step,
                values: data.values,
            }),
            Err(e) => {
                tracing::warn!("Fetch for {} failed, omitting series: {e:#}", leaf.path);
            },
        }
    }
    Ok(Json(series_list))
}
