use std::{collections::HashMap, fmt, sync::Arc};

use axum::{
    body::Body,
    extract::{Query, State},
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use crate::{
    cluster::{ClusterView, Server},
    registry::{InstanceMeta, RegistrySnapshot, RegistryState},
};

pub const PATH_REG: &str = "/reg";
pub const PATH_UNREG: &str = "/unreg";
pub const PATH_FIND_ALL: &str = "/findAll";
pub const PATH_RENEW: &str = "/renew";
pub const PATH_RENEWS: &str = "/renews";
pub const PATH_VERSION: &str = "/version";
pub const PATH_VERSIONS: &str = "/versions";
pub const PATH_INFO: &str = "/info";
pub const PATH_CLUSTER: &str = "/cluster";
pub const PATH_LEADER: &str = "/leader";
pub const PATH_SNAPSHOT: &str = "/snapshot";
pub const PATH_HEALTH: &str = "/health";

// Categorized causes for request rejection
#[derive(Debug, Clone)]
pub enum ErrorCause {
    NoLeader,
    NotLeader(String),
    MalformedRequest(String),
    Other(String),
}

impl ErrorCause {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NoLeader => StatusCode::FORBIDDEN,
            Self::NotLeader(_) => StatusCode::FORBIDDEN,
            Self::MalformedRequest(_) => StatusCode::BAD_REQUEST,
            Self::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn details(&self) -> Option<String> {
        match self {
            Self::NoLeader => Some("the cluster has no leader".to_string()),
            Self::NotLeader(x) => Some(format!("writes go to the leader at {x}")),
            Self::MalformedRequest(x) => Some(x.clone()),
            Self::Other(x) => Some(x.clone()),
        }
    }
}

impl fmt::Display for ErrorCause {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::NoLeader => write!(f, "no_leader"),
            Self::NotLeader(_) => write!(f, "not_leader"),
            Self::MalformedRequest(_) => write!(f, "malformed_request"),
            Self::Other(_) => write!(f, "general_error"),
        }
    }
}

// Creates the response from ErrorCause and injects itself into extensions to
// be visible by middleware
impl IntoResponse for ErrorCause {
    fn into_response(self) -> Response {
        let mut body = self.to_string();

        if let Some(x) = self.details() {
            body = format!("{body}: {x}");
        }

        let mut response = (self.status_code(), format!("{body}\n")).into_response();
        response.extensions_mut().insert(self);
        response
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("rejected: {0}")]
    Rejected(ErrorCause),

    #[error(transparent)]
    Unspecified(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Rejected(x) => x.into_response(),
            ApiError::Unspecified(e) => {
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
            }
        }
    }
}

impl From<ErrorCause> for ApiError {
    fn from(x: ErrorCause) -> Self {
        ApiError::Rejected(x)
    }
}

/// State shared by all handlers.
pub struct ApiState {
    pub registry: Arc<RegistryState>,
    pub cluster: Arc<ClusterView>,
}

#[derive(Debug, Deserialize)]
pub struct ServiceParam {
    pub service: String,
}

#[derive(Debug, Deserialize)]
pub struct ServicesParam {
    pub services: String,
}

fn split_services(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|x| !x.is_empty())
        .map(String::from)
        .collect()
}

// Middleware: admits writes only on the leader
pub async fn check_leader(
    State(s): State<Arc<ApiState>>,
    request: Request<Body>,
    next: Next<Body>,
) -> Result<impl IntoResponse, ApiError> {
    if !s.cluster.is_self_leader() {
        let cause = match s.cluster.leader() {
            Some(x) => ErrorCause::NotLeader(x.url.clone()),
            None => ErrorCause::NoLeader,
        };
        return Err(cause.into());
    }

    Ok(next.run(request).await)
}

// Handler: registers an instance under a service
pub async fn register(
    State(s): State<Arc<ApiState>>,
    Query(q): Query<ServiceParam>,
    Json(instance): Json<InstanceMeta>,
) -> Json<InstanceMeta> {
    Json(s.registry.register(&q.service, instance))
}

// Handler: removes an instance; absent services and instances are no-ops
pub async fn unregister(
    State(s): State<Arc<ApiState>>,
    Query(q): Query<ServiceParam>,
    Json(instance): Json<InstanceMeta>,
) -> Json<InstanceMeta> {
    s.registry.unregister(&q.service, &instance);
    Json(instance)
}

// Handler: lists the service's instances; unknown services serialize as empty
pub async fn find_all(
    State(s): State<Arc<ApiState>>,
    Query(q): Query<ServiceParam>,
) -> Json<Vec<InstanceMeta>> {
    Json(s.registry.get_all(&q.service).unwrap_or_default())
}

// Handler: heartbeat for one service
pub async fn renew(
    State(s): State<Arc<ApiState>>,
    Query(q): Query<ServiceParam>,
    Json(instance): Json<InstanceMeta>,
) -> Json<InstanceMeta> {
    s.registry.renew(&q.service, &instance);
    Json(instance)
}

// Handler: batch heartbeat over a comma-joined service list
pub async fn renews(
    State(s): State<Arc<ApiState>>,
    Query(q): Query<ServicesParam>,
    Json(instance): Json<InstanceMeta>,
) -> Result<Json<InstanceMeta>, ApiError> {
    let services = split_services(&q.services);
    if services.is_empty() {
        return Err(ErrorCause::MalformedRequest("no services given".to_string()).into());
    }

    s.registry.renews(&services, &instance);
    Ok(Json(instance))
}

// Handler: polling version of one service
pub async fn version(
    State(s): State<Arc<ApiState>>,
    Query(q): Query<ServiceParam>,
) -> Json<u64> {
    Json(s.registry.version(&q.service))
}

// Handler: polling versions of a comma-joined service list
pub async fn versions(
    State(s): State<Arc<ApiState>>,
    Query(q): Query<ServicesParam>,
) -> Json<HashMap<String, u64>> {
    Json(s.registry.versions(&split_services(&q.services)))
}

// Handler: this node as a cluster member, with its current global version
pub async fn info(State(s): State<Arc<ApiState>>) -> Result<Json<Server>, ApiError> {
    let server = s
        .cluster
        .self_server()
        .ok_or_else(|| ErrorCause::Other("self not present in cluster view".to_string()))?;

    let mut server = (*server).clone();
    server.version = s.registry.global_version();

    Ok(Json(server))
}

// Handler: the whole peer set
pub async fn cluster(State(s): State<Arc<ApiState>>) -> Json<Vec<Server>> {
    Json(
        s.cluster
            .servers()
            .into_iter()
            .map(|x| (*x).clone())
            .collect(),
    )
}

// Handler: the current leader, if any
pub async fn leader(State(s): State<Arc<ApiState>>) -> Json<Option<Server>> {
    Json(s.cluster.leader().map(|x| (*x).clone()))
}

// Handler: exports a fresh snapshot; served by any node
pub async fn snapshot(State(s): State<Arc<ApiState>>) -> Json<RegistrySnapshot> {
    Json(s.registry.snapshot())
}

// Handler: emit an HTTP status code that signals the node's state
pub async fn health(State(s): State<Arc<ApiState>>) -> impl IntoResponse {
    if s.cluster.leader().is_some() {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

pub fn setup_router(state: Arc<ApiState>) -> Router {
    let writes = Router::new()
        .route(PATH_REG, post(register))
        .route(PATH_UNREG, post(unregister))
        .route(PATH_RENEW, post(renew))
        .route(PATH_RENEWS, post(renews))
        .route_layer(middleware::from_fn_with_state(state.clone(), check_leader));

    let reads = Router::new()
        .route(PATH_FIND_ALL, get(find_all))
        .route(PATH_VERSION, post(version))
        .route(PATH_VERSIONS, post(versions))
        .route(PATH_INFO, get(info))
        .route(PATH_CLUSTER, get(cluster))
        .route(PATH_LEADER, get(leader))
        .route(PATH_SNAPSHOT, get(snapshot))
        .route(PATH_HEALTH, get(health));

    Router::new().merge(writes).merge(reads).with_state(state)
}
