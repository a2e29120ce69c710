use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::routing::{post, put};
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::api::error::ApiError;
use crate::error::VolumeError;
use crate::volume::{ProviderFactory, ProviderSpec, Volume, VolumeManager};

/// Handlers for `/volume`.
pub struct VolumesApi {
    manager: Arc<VolumeManager>,
    factory: ProviderFactory,
}

impl VolumesApi {
    pub fn new(manager: Arc<VolumeManager>, factory: ProviderFactory) -> Self {
        Self { manager, factory }
    }

    pub fn routes(self: Arc<Self>) -> Router {
        Router::new()
            .route("/volume/provider", post(create_provider))
            .route(
                "/volume/provider/{provider_id}/newVolume",
                post(new_volume),
            )
            .route("/volume/x/{id}/snapshot", put(snapshot))
            .with_state(self)
    }
}

async fn create_provider(
    State(api): State<Arc<VolumesApi>>,
    payload: Result<Json<ProviderSpec>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(spec) = payload?;
    let id = spec.provider_id()?;
    if api.manager.provider(&id).is_some() {
        return Err(VolumeError::ProviderAlreadyExists(id).into());
    }
    let provider = api.factory.build(&spec).await?;
    api.manager.add_provider(id, provider)?;
    Ok(Json(json!({})))
}

/// Responds with the new volume's ID as a JSON string.
async fn new_volume(
    State(api): State<Arc<VolumesApi>>,
    Path(provider_id): Path<String>,
) -> Result<Json<String>, ApiError> {
    let volume = api.manager.new_volume_from_provider(&provider_id).await?;
    Ok(Json(volume.id))
}

async fn snapshot(
    State(api): State<Arc<VolumesApi>>,
    Path(id): Path<String>,
) -> Result<Json<Volume>, ApiError> {
    let snapshot = api.manager.snapshot(&id).await?;
    Ok(Json(snapshot))
}
