//! API endpoints for the network defense service.
//!
//! This module provides the HTTP surface used by dashboards and the capture
//! collaborator: statistics, block and whitelist management, detection
//! history, and intake of flow observations and connection attempts.

use std::sync::Arc;

use actix_web::{web, HttpResponse, Responder};
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::store::{BlockFilter, WhitelistTarget};
use crate::core::{ConnectionAttempt, ConnectionIdentity, DefensePipeline, FlowObservation, PipelineError, WhitelistEntry};
use crate::models::Config;

pub struct ApiState {
    pub pipeline: Arc<DefensePipeline>,
    pub observations: mpsc::Sender<FlowObservation>,
    pub config: Arc<Config>,
}

/// API configuration function for Actix-web
pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .service(web::resource("/health").route(web::get().to(health_check)))
            .service(web::resource("/statistics").route(web::get().to(statistics)))
            .service(web::resource("/blocks/export.csv").route(web::get().to(export_blocks)))
            .service(
                web::resource("/blocks")
                    .route(web::get().to(list_blocks))
                    .route(web::delete().to(unblock)),
            )
            .service(
                web::resource("/whitelist")
                    .route(web::get().to(list_whitelist))
                    .route(web::post().to(add_whitelist)),
            )
            .service(web::resource("/whitelist/{id}").route(web::delete().to(remove_whitelist)))
            .service(web::resource("/reconcile").route(web::post().to(reconcile)))
            .service(web::resource("/detections").route(web::get().to(detections)))
            .service(web::resource("/observations").route(web::post().to(observe)))
            .service(web::resource("/connections").route(web::post().to(evaluate_connection))),
    );
}

/// Health check endpoint response
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: String,
    version: String,
    tracked_flows: usize,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, Deserialize)]
pub struct BlocksQuery {
    #[serde(default)]
    pub filter: BlockFilter,
}

#[derive(Debug, Deserialize)]
pub struct DetectionsQuery {
    pub limit: Option<usize>,
}

/// Whitelist creation request
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhitelistRequest {
    pub target: WhitelistTarget,
    pub reason: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WhitelistResponse {
    entry: WhitelistEntry,
    unblocked: Vec<ConnectionIdentity>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ObservationsResponse {
    accepted: usize,
    dropped: usize,
}

fn error_response(e: PipelineError) -> HttpResponse {
    let body = ErrorResponse { error: e.to_string() };
    match e {
        PipelineError::Halted(_) | PipelineError::Store(_) => HttpResponse::ServiceUnavailable().json(body),
        _ => HttpResponse::InternalServerError().json(body),
    }
}

/// Health check endpoint
async fn health_check(state: web::Data<ApiState>) -> impl Responder {
    let status = if state.pipeline.is_halted() { "halted" } else { "ok" };
    HttpResponse::Ok().json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        tracked_flows: state.pipeline.aggregator().len(),
    })
}

async fn statistics(state: web::Data<ApiState>) -> HttpResponse {
    match state.pipeline.statistics().await {
        Ok(stats) => HttpResponse::Ok().json(stats),
        Err(e) => error_response(e),
    }
}

async fn list_blocks(state: web::Data<ApiState>, query: web::Query<BlocksQuery>) -> HttpResponse {
    match state.pipeline.list_blocks(query.filter).await {
        Ok(blocks) => HttpResponse::Ok().json(blocks),
        Err(e) => error_response(e),
    }
}

async fn export_blocks(state: web::Data<ApiState>) -> HttpResponse {
    match state.pipeline.export_csv().await {
        Ok(csv) => HttpResponse::Ok().content_type("text/csv").body(csv),
        Err(e) => error_response(e),
    }
}

/// Unblock endpoint; the body is the identity of the block
async fn unblock(state: web::Data<ApiState>, identity: web::Json<ConnectionIdentity>) -> HttpResponse {
    match state.pipeline.unblock(&identity).await {
        Ok(Some(record)) => HttpResponse::Ok().json(record),
        Ok(None) => HttpResponse::NotFound().json(ErrorResponse {
            error: format!("no block for {}", identity.key()),
        }),
        Err(e) => error_response(e),
    }
}

async fn list_whitelist(state: web::Data<ApiState>) -> HttpResponse {
    match state.pipeline.list_whitelist().await {
        Ok(entries) => HttpResponse::Ok().json(entries),
        Err(e) => error_response(e),
    }
}

async fn add_whitelist(state: web::Data<ApiState>, req: web::Json<WhitelistRequest>) -> HttpResponse {
    let req = req.into_inner();
    let entry = WhitelistEntry::new(req.target, req.reason, req.expires_at);
    match state.pipeline.whitelist(entry.clone()).await {
        Ok(unblocked) => HttpResponse::Created().json(WhitelistResponse { entry, unblocked }),
        Err(e) => error_response(e),
    }
}

async fn remove_whitelist(state: web::Data<ApiState>, id: web::Path<Uuid>) -> HttpResponse {
    match state.pipeline.remove_whitelist(id.into_inner()).await {
        Ok(true) => HttpResponse::NoContent().finish(),
        Ok(false) => HttpResponse::NotFound().finish(),
        Err(e) => error_response(e),
    }
}

async fn reconcile(state: web::Data<ApiState>) -> HttpResponse {
    match state.pipeline.reconcile(None).await {
        Ok(report) => HttpResponse::Ok().json(report),
        Err(e) => error_response(e),
    }
}

async fn detections(state: web::Data<ApiState>, query: web::Query<DetectionsQuery>) -> impl Responder {
    let limit = query.limit.unwrap_or(50).min(state.config.detection.history_capacity);
    HttpResponse::Ok().json(state.pipeline.recent_detections(limit).await)
}

/// Flow intake; observations beyond the queue capacity are dropped
async fn observe(state: web::Data<ApiState>, batch: web::Json<Vec<FlowObservation>>) -> impl Responder {
    let mut accepted = 0;
    let mut dropped = 0;
    for observation in batch.into_inner() {
        match state.observations.try_send(observation) {
            Ok(()) => accepted += 1,
            Err(_) => dropped += 1,
        }
    }
    if dropped > 0 {
        metrics::counter!("flow_observations_dropped_total", dropped as u64);
        warn!("Observation queue full, dropped {} observations", dropped);
    }
    HttpResponse::Accepted().json(ObservationsResponse { accepted, dropped })
}

async fn evaluate_connection(state: web::Data<ApiState>, attempt: web::Json<ConnectionAttempt>) -> HttpResponse {
    match state.pipeline.handle_attempt(attempt.into_inner()).await {
        Ok(outcome) => HttpResponse::Ok().json(outcome),
        Err(e) => error_response(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::firewall::InMemoryFirewall;
    use crate::core::store::FileStore;
    use crate::core::threat_intel::{StaticIndicator, StaticThreatIntel};
    use crate::core::ThreatIntelChain;
    use actix_web::{test, web, App};

    async fn state(dir: &tempfile::TempDir) -> (web::Data<ApiState>, mpsc::Receiver<FlowObservation>) {
        let config = Arc::new(Config::default());
        let store = Arc::new(FileStore::open(dir.path().join("blocks.json")).await.unwrap());
        let intel = ThreatIntelChain::new(vec![Arc::new(StaticThreatIntel::new(vec![StaticIndicator {
            indicator: "198.51.100.9".to_string(),
            confidence: 0.95,
            category: None,
        }]))]);
        let pipeline = DefensePipeline::new(&config, store, Arc::new(InMemoryFirewall::new()), intel).unwrap();
        let (tx, rx) = mpsc::channel(2);
        let state = web::Data::new(ApiState {
            pipeline: Arc::new(pipeline),
            observations: tx,
            config,
        });
        (state, rx)
    }

    fn connection() -> serde_json::Value {
        serde_json::json!({
            "processName": "app.exe",
            "processPath": "C:\\Program Files\\App\\app.exe",
            "signer": { "status": "Signed", "signer": "App Inc" },
            "isFirstSeenProcess": false,
            "remoteAddress": "198.51.100.9",
            "remotePort": 443,
            "protocol": "Tcp"
        })
    }

    #[actix_web::test]
    async fn test_health_check() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _rx) = state(&dir).await;
        let app = test::init_service(App::new().app_data(state).configure(config)).await;

        let req = test::TestRequest::get().uri("/api/v1/health").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["status"], "ok");
        assert_eq!(body["trackedFlows"], 0);
    }

    #[actix_web::test]
    async fn test_snake_case_bodies_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _rx) = state(&dir).await;
        let app = test::init_service(App::new().app_data(state).configure(config)).await;

        let req = test::TestRequest::post()
            .uri("/api/v1/connections")
            .set_json(serde_json::json!({
                "process_name": "app.exe",
                "signer": { "status": "Unsigned" },
                "remote_address": "198.51.100.9",
                "remote_port": 443,
                "protocol": "Tcp"
            }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_client_error());
    }

    #[actix_web::test]
    async fn test_block_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _rx) = state(&dir).await;
        let app = test::init_service(App::new().app_data(state).configure(config)).await;

        let req = test::TestRequest::post()
            .uri("/api/v1/connections")
            .set_json(connection())
            .to_request();
        let outcome: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(outcome["decision"]["level"], "Immediate");
        assert_eq!(outcome["enforcement"]["enforcement"], "permanent_block");
        assert!(outcome["enforcement"]["ruleName"].is_string());
        assert_eq!(outcome["decision"]["identity"]["remoteAddress"], "198.51.100.9");
        assert!(outcome["decision"]["triggeredRules"].is_array());

        let req = test::TestRequest::get().uri("/api/v1/blocks?filter=permanent").to_request();
        let blocks: Vec<serde_json::Value> = test::call_and_read_body_json(&app, req).await;
        assert_eq!(blocks.len(), 1);

        let req = test::TestRequest::get().uri("/api/v1/blocks/export.csv").to_request();
        let body = test::call_and_read_body(&app, req).await;
        assert_eq!(String::from_utf8_lossy(&body).lines().count(), 2);

        let req = test::TestRequest::delete()
            .uri("/api/v1/blocks")
            .set_json(serde_json::json!({
                "processName": "app.exe",
                "remoteAddress": "198.51.100.9",
                "remotePort": 443,
                "protocol": "Tcp"
            }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());

        let req = test::TestRequest::get().uri("/api/v1/statistics").to_request();
        let stats: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(stats["totalBlocks"], 0);
    }

    #[actix_web::test]
    async fn test_whitelist_prevents_block() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _rx) = state(&dir).await;
        let app = test::init_service(App::new().app_data(state).configure(config)).await;

        let req = test::TestRequest::post()
            .uri("/api/v1/whitelist")
            .set_json(WhitelistRequest {
                target: WhitelistTarget::Address("198.51.100.9".to_string()),
                reason: "partner".to_string(),
                expires_at: None,
            })
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::CREATED);

        let req = test::TestRequest::post()
            .uri("/api/v1/connections")
            .set_json(connection())
            .to_request();
        let outcome: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(outcome["decision"]["whitelisted"], true);
        assert_eq!(outcome["enforcement"]["enforcement"], "none");
    }

    #[actix_web::test]
    async fn test_observations_beyond_capacity_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let (state, mut rx) = state(&dir).await;
        let app = test::init_service(App::new().app_data(state).configure(config)).await;

        let observation = serde_json::json!({
            "timestamp": Utc::now(),
            "protocol": "Udp",
            "srcAddr": "203.0.113.9",
            "srcPort": 5353,
            "dstAddr": "10.0.0.2",
            "dstPort": 53,
            "length": 512
        });
        let req = test::TestRequest::post()
            .uri("/api/v1/observations")
            .set_json(vec![observation.clone(), observation.clone(), observation])
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["accepted"], 2);
        assert_eq!(body["dropped"], 1);
        assert!(rx.recv().await.is_some());
    }
}
