use axum::{extract::State, Json};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::state::AppState;

#[derive(Serialize)]
pub struct ModelObject {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub owned_by: &'static str,
}

#[derive(Serialize)]
pub struct ModelsResponse {
    pub object: &'static str,
    pub data: Vec<ModelObject>,
}

/// Registered models, plus anything resident that was resolved from the hub
/// cache instead.
pub async fn list_models(State(state): State<Arc<AppState>>) -> Json<ModelsResponse> {
    let registry = state.registry.read().await;
    let mut seen = BTreeSet::new();
    let mut data: Vec<ModelObject> = registry
        .list()
        .iter()
        .map(|m| {
            seen.insert(m.name.clone());
            ModelObject {
                id: m.name.clone(),
                object: "model",
                created: m.added_at.timestamp(),
                owned_by: "user",
            }
        })
        .collect();

    for resident in state.cache.resident() {
        if seen.insert(resident.id.clone()) {
            data.push(ModelObject {
                id: resident.id,
                object: "model",
                created: resident.loaded_at.timestamp(),
                owned_by: "user",
            });
        }
    }

    Json(ModelsResponse {
        object: "list",
        data,
    })
}
