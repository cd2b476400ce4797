//! Service and backend endpoints.
//!
//! `/{service}` and `/{service}/{backend}` address registry objects by name.
//! Mutations reply with the resulting stats and persist the snapshot.

use axum::{
    body::Bytes,
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use serde::de::DeserializeOwned;

use crate::api::error::ApiError;
use crate::model::{BackendConfig, BackendStat, ServiceConfig, ServiceStat};
use crate::state::AppState;

/// Create service routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_stats))
        .route("/_config", get(get_config))
        .route(
            "/{service}",
            get(get_service)
                .put(put_service)
                .post(put_service)
                .delete(delete_service),
        )
        .route(
            "/{service}/{backend}",
            get(get_backend)
                .put(put_backend)
                .post(put_backend)
                .delete(delete_backend),
        )
}

/// Decode a JSON body. An empty body decodes as the default document.
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::bad_request("invalid_json", e.to_string()))
}

async fn list_stats(State(state): State<AppState>) -> Json<Vec<ServiceStat>> {
    Json(state.registry().stats().await)
}

async fn get_config(State(state): State<AppState>) -> Json<Vec<ServiceConfig>> {
    Json(state.registry().config().await)
}

async fn get_service(
    State(state): State<AppState>,
    Path(service): Path<String>,
) -> Result<Json<ServiceStat>, ApiError> {
    Ok(Json(state.registry().service_stats(&service).await?))
}

/// Create the service if absent, then update it.
async fn put_service(
    State(state): State<AppState>,
    Path(service): Path<String>,
    body: Bytes,
) -> Result<Json<ServiceStat>, ApiError> {
    let mut config: ServiceConfig = parse_body(&body)?;
    config.name = service;

    let stats = state.registry().put_service(config).await?;
    state.persist().await;
    Ok(Json(stats))
}

async fn delete_service(
    State(state): State<AppState>,
    Path(service): Path<String>,
) -> Result<Json<Vec<ServiceStat>>, ApiError> {
    state.registry().remove_service(&service).await?;
    state.persist().await;
    Ok(Json(state.registry().stats().await))
}

async fn get_backend(
    State(state): State<AppState>,
    Path((service, backend)): Path<(String, String)>,
) -> Result<Json<BackendStat>, ApiError> {
    Ok(Json(state.registry().backend_stats(&service, &backend).await?))
}

async fn put_backend(
    State(state): State<AppState>,
    Path((service, backend)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<ServiceStat>, ApiError> {
    let mut config: BackendConfig = parse_body(&body)?;
    config.name = backend;

    let stats = state.registry().add_backend(&service, config).await?;
    state.persist().await;
    Ok(Json(stats))
}

async fn delete_backend(
    State(state): State<AppState>,
    Path((service, backend)): Path<(String, String)>,
) -> Result<Json<ServiceStat>, ApiError> {
    let stats = state.registry().remove_backend(&service, &backend).await?;
    state.persist().await;
    Ok(Json(stats))
}
