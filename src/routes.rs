// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! # HTTP Routes
//!
//! Thin warp adapter translating the HTTP surface onto core calls. Handlers
//! never hold core state of their own; they validate auth where required,
//! call into the registry / prober / balancer / discovery, and shape the
//! response. Every error body has the `{error, details?}` shape.

use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;
use uuid::Uuid;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::auth::AuthValidator;
use crate::balancer::{LoadBalancer, NextOptions, Policy};
use crate::constants::protocol;
use crate::discovery::{SelectionCriteria, ServiceDiscovery};
use crate::errors::{CoreError, ErrorResponse};
use crate::health::HealthProber;
use crate::models::{RegistrationRequest, RegistryStats};
use crate::registry::Registry;

/// Shared handle bundle handed to every route
#[derive(Clone)]
pub struct AppContext {
    pub registry: Arc<Registry>,
    pub prober: Arc<HealthProber>,
    pub balancer: Arc<LoadBalancer>,
    pub discovery: Arc<ServiceDiscovery>,
    pub auth: AuthValidator,
    pub default_policy: Policy,
    pub started_at: Instant,
}

/// Body of `POST /loadbalancer/next/{capability}`
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextRequest {
    pub strategy: Option<String>,
    #[serde(default)]
    pub options: Option<NextOptions>,
}

#[derive(Debug, Serialize)]
struct RemovedResponse {
    removed: bool,
}

#[derive(Debug, Serialize)]
struct ReleasedResponse {
    released: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ServiceInfo {
    name: String,
    version: String,
    uptime_seconds: u64,
}

/// Body of the core's own liveness endpoint
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthSummary {
    status: String,
    service: ServiceInfo,
    registry: RegistryStats,
}

/// Compose the full route tree.
pub fn api(
    context: AppContext,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let register = warp::path!("mcp" / "servers")
        .and(warp::post())
        .and(auth_header())
        .and(warp::body::json())
        .and(with_context(context.clone()))
        .and_then(register_handler);

    let list_all = warp::path!("mcp" / "servers")
        .and(warp::get())
        .and(with_context(context.clone()))
        .and_then(list_all_handler);

    let list_healthy = warp::path!("mcp" / "servers" / "healthy")
        .and(warp::get())
        .and(with_context(context.clone()))
        .and_then(list_healthy_handler);

    let by_capability = warp::path!("mcp" / "servers" / "capability" / String)
        .and(warp::get())
        .and(with_context(context.clone()))
        .and_then(by_capability_handler);

    let next_simple = warp::path!("mcp" / "servers" / "next" / String)
        .and(warp::get())
        .and(with_context(context.clone()))
        .and_then(next_simple_handler);

    let get_server = warp::path!("mcp" / "servers" / Uuid)
        .and(warp::get())
        .and(with_context(context.clone()))
        .and_then(get_server_handler);

    let unregister = warp::path!("mcp" / "servers" / Uuid)
        .and(warp::delete())
        .and(auth_header())
        .and(with_context(context.clone()))
        .and_then(unregister_handler);

    let probe_now = warp::path!("mcp" / "servers" / Uuid / "health-check")
        .and(warp::post())
        .and(auth_header())
        .and(with_context(context.clone()))
        .and_then(probe_now_handler);

    let stats = warp::path!("mcp" / "stats")
        .and(warp::get())
        .and(with_context(context.clone()))
        .and_then(stats_handler);

    let lb_next = warp::path!("loadbalancer" / "next" / String)
        .and(warp::post())
        .and(warp::body::json())
        .and(with_context(context.clone()))
        .and_then(lb_next_handler);

    let lb_release = warp::path!("loadbalancer" / "release" / Uuid)
        .and(warp::post())
        .and(with_context(context.clone()))
        .and_then(lb_release_handler);

    let discover = warp::path!("discovery" / "services" / String)
        .and(warp::get())
        .and(with_context(context.clone()))
        .and_then(discover_handler);

    let capabilities = warp::path!("discovery" / "capabilities")
        .and(warp::get())
        .and(with_context(context.clone()))
        .and_then(capabilities_handler);

    let best_server = warp::path!("discovery" / "best-server" / String)
        .and(warp::post())
        .and(warp::body::json())
        .and(with_context(context.clone()))
        .and_then(best_server_handler);

    let own_health = warp::path!("health")
        .and(warp::get())
        .and(with_context(context))
        .and_then(own_health_handler);

    register
        .or(list_healthy)
        .or(by_capability)
        .or(next_simple)
        .or(probe_now)
        .or(unregister)
        .or(get_server)
        .or(list_all)
        .or(stats)
        .or(lb_next)
        .or(lb_release)
        .or(discover)
        .or(capabilities)
        .or(best_server)
        .or(own_health)
}

fn with_context(
    context: AppContext,
) -> impl Filter<Extract = (AppContext,), Error = Infallible> + Clone {
    warp::any().map(move || context.clone())
}

fn auth_header() -> impl Filter<Extract = (Option<String>,), Error = Rejection> + Clone {
    warp::header::optional::<String>("authorization")
}

type JsonReply = warp::reply::WithStatus<warp::reply::Json>;

fn json_reply<T: Serialize>(value: &T, status: StatusCode) -> JsonReply {
    warp::reply::with_status(warp::reply::json(value), status)
}

fn error_reply(error: &CoreError) -> JsonReply {
    json_reply(&ErrorResponse::from(error), error.status_code())
}

async fn register_handler(
    auth_header: Option<String>,
    body: RegistrationRequest,
    context: AppContext,
) -> Result<JsonReply, Infallible> {
    let auth = match context.auth.authenticate(auth_header.as_deref()) {
        Ok(auth) => auth,
        Err(error) => return Ok(error_reply(&error)),
    };

    match context.registry.register(body).await {
        Ok(id) => {
            info!(%id, principal = %auth.principal, "server registered over HTTP");
            match context.registry.get(id).await {
                Some(server) => Ok(json_reply(&server, StatusCode::CREATED)),
                None => Ok(error_reply(&CoreError::Internal(
                    "server disappeared during registration".to_string(),
                ))),
            }
        }
        Err(error) => Ok(error_reply(&error)),
    }
}

async fn list_all_handler(context: AppContext) -> Result<JsonReply, Infallible> {
    Ok(json_reply(&context.registry.all().await, StatusCode::OK))
}

async fn list_healthy_handler(context: AppContext) -> Result<JsonReply, Infallible> {
    Ok(json_reply(&context.registry.healthy().await, StatusCode::OK))
}

async fn by_capability_handler(
    capability: String,
    context: AppContext,
) -> Result<JsonReply, Infallible> {
    Ok(json_reply(
        &context.registry.by_capability(&capability).await,
        StatusCode::OK,
    ))
}

async fn get_server_handler(id: Uuid, context: AppContext) -> Result<JsonReply, Infallible> {
    match context.registry.get(id).await {
        Some(server) => Ok(json_reply(&server, StatusCode::OK)),
        None => Ok(error_reply(&CoreError::NotFound(format!("server {}", id)))),
    }
}

async fn unregister_handler(
    id: Uuid,
    auth_header: Option<String>,
    context: AppContext,
) -> Result<JsonReply, Infallible> {
    let auth = match context.auth.authenticate(auth_header.as_deref()) {
        Ok(auth) => auth,
        Err(error) => return Ok(error_reply(&error)),
    };

    if context.registry.unregister(id).await {
        info!(%id, principal = %auth.principal, "server unregistered over HTTP");
        Ok(json_reply(&RemovedResponse { removed: true }, StatusCode::OK))
    } else {
        Ok(error_reply(&CoreError::NotFound(format!("server {}", id))))
    }
}

async fn probe_now_handler(
    id: Uuid,
    auth_header: Option<String>,
    context: AppContext,
) -> Result<JsonReply, Infallible> {
    if let Err(error) = context.auth.authenticate(auth_header.as_deref()) {
        return Ok(error_reply(&error));
    }

    match context.prober.probe_now(id).await {
        Ok(_) => match context.registry.get(id).await {
            Some(server) => Ok(json_reply(&server, StatusCode::OK)),
            None => Ok(error_reply(&CoreError::NotFound(format!("server {}", id)))),
        },
        Err(error) => Ok(error_reply(&error)),
    }
}

async fn stats_handler(context: AppContext) -> Result<JsonReply, Infallible> {
    Ok(json_reply(&context.registry.stats().await, StatusCode::OK))
}

async fn next_simple_handler(
    capability: String,
    context: AppContext,
) -> Result<JsonReply, Infallible> {
    let options = NextOptions::default();
    match context
        .balancer
        .next(&capability, context.default_policy, &options)
        .await
    {
        Some(server) => Ok(json_reply(&server, StatusCode::OK)),
        None => Ok(error_reply(&CoreError::NoCandidates(capability))),
    }
}

async fn lb_next_handler(
    capability: String,
    body: NextRequest,
    context: AppContext,
) -> Result<JsonReply, Infallible> {
    let options = body.options.unwrap_or_default();
    let strategy = body
        .strategy
        .unwrap_or_else(|| context.default_policy.as_str().to_string());
    match context
        .balancer
        .next_named(&capability, &strategy, &options)
        .await
    {
        Some(server) => Ok(json_reply(&server, StatusCode::OK)),
        None => Ok(error_reply(&CoreError::NoCandidates(capability))),
    }
}

async fn lb_release_handler(id: Uuid, context: AppContext) -> Result<JsonReply, Infallible> {
    context.balancer.release(id);
    Ok(json_reply(&ReleasedResponse { released: true }, StatusCode::OK))
}

async fn discover_handler(
    capability: String,
    context: AppContext,
) -> Result<JsonReply, Infallible> {
    Ok(json_reply(
        &context.discovery.discover(&capability).await,
        StatusCode::OK,
    ))
}

async fn capabilities_handler(context: AppContext) -> Result<JsonReply, Infallible> {
    Ok(json_reply(&context.discovery.capabilities().await, StatusCode::OK))
}

async fn best_server_handler(
    capability: String,
    criteria: SelectionCriteria,
    context: AppContext,
) -> Result<JsonReply, Infallible> {
    match context.discovery.best_server(&capability, &criteria).await {
        Some(server) => Ok(json_reply(&server, StatusCode::OK)),
        None => Ok(error_reply(&CoreError::NoCandidates(capability))),
    }
}

async fn own_health_handler(context: AppContext) -> Result<JsonReply, Infallible> {
    let summary = HealthSummary {
        status: "healthy".to_string(),
        service: ServiceInfo {
            name: protocol::server_name(),
            version: protocol::SERVER_VERSION.to_string(),
            uptime_seconds: context.started_at.elapsed().as_secs(),
        },
        registry: context.registry.stats().await,
    };
    Ok(json_reply(&summary, StatusCode::OK))
}

/// Map warp rejections onto the standard error shape.
pub async fn handle_rejection(rejection: Rejection) -> Result<impl Reply, Infallible> {
    let (status, error, details) = if rejection.is_not_found() {
        (StatusCode::NOT_FOUND, "not_found", None)
    } else if let Some(err) = rejection.find::<warp::filters::body::BodyDeserializeError>() {
        (
            StatusCode::BAD_REQUEST,
            "invalid_input",
            Some(err.to_string()),
        )
    } else if rejection.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "method_not_allowed", None)
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "internal", None)
    };

    let body = ErrorResponse {
        error: error.to_string(),
        details,
    };
    Ok(warp::reply::with_status(warp::reply::json(&body), status))
}
