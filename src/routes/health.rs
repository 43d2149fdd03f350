use axum::response::Json;
use serde::Serialize;

#[derive(Serialize)]
pub struct Status {
    status: &'static str,
}

/// Liveness only; the model is loaded before the listener is bound.
pub async fn healthcheck() -> Json<Status> {
    Json(Status {
        status: "Available",
    })
}
