use crate::server::SharedState;
use axum::{extract::State, response::Json};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct LabelSet {
    pub model: String,
    pub labels: Vec<String>,
}

pub async fn labels(State(state): State<SharedState>) -> Json<LabelSet> {
    Json(LabelSet {
        model: state.model.name().to_string(),
        labels: state.model.labels().to_vec(),
    })
}
