use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use base64::{prelude::BASE64_STANDARD, Engine};
use mosaic_core::{DecodedImage, Error, ExcessPolicy, Generation, Pipeline, SamplingParams};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};

#[derive(Debug, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub n: Option<usize>,
    pub top_k: Option<usize>,
    pub top_p: Option<f64>,
    pub temperature: Option<f64>,
    pub condition_scale: Option<f64>,
    pub seed: Option<u64>,
    pub score: Option<bool>,
    pub excess: Option<ExcessPolicy>,
}

impl GenerationRequest {
    /// Request fields layered over the configured defaults.
    fn params(&self, defaults: &SamplingParams) -> SamplingParams {
        SamplingParams {
            top_k: self.top_k.or(defaults.top_k),
            top_p: self.top_p.or(defaults.top_p),
            temperature: self.temperature.or(defaults.temperature),
            condition_scale: self.condition_scale.unwrap_or(defaults.condition_scale),
            n_predictions: self.n.unwrap_or(defaults.n_predictions),
            seed: self.seed.or(defaults.seed),
            excess: self.excess.unwrap_or(defaults.excess),
            score: self.score.unwrap_or(defaults.score),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ImageData {
    pub b64_json: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

#[derive(Debug, Serialize)]
pub struct GenerationResponse {
    pub seed: u64,
    pub rounds: usize,
    pub data: Vec<ImageData>,
}

impl GenerationResponse {
    fn from_generation(generation: Generation) -> mosaic_core::Result<Self> {
        let scores = generation.scores.as_deref();
        let data = generation
            .images
            .iter()
            .enumerate()
            .map(|(i, img)| {
                Ok(ImageData {
                    b64_json: image_to_base64_png(img)?,
                    score: scores.map(|s| s[i]),
                })
            })
            .collect::<mosaic_core::Result<Vec<_>>>()?;
        Ok(Self {
            seed: generation.seed,
            rounds: generation.rounds,
            data,
        })
    }
}

fn image_to_base64_png(img: &DecodedImage) -> mosaic_core::Result<String> {
    Ok(BASE64_STANDARD.encode(img.to_png()?))
}

/// Pipeline shared by every request, plus the configured sampling defaults.
#[derive(Clone)]
struct AppState {
    pipeline: Arc<Pipeline>,
    defaults: Arc<SamplingParams>,
}

struct ApiError(Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Config(_) | Error::Tokenize(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %self.0, "generation failed");
        }
        (status, format!("Error: {}", self.0)).into_response()
    }
}

async fn generate_image_handler(
    State(state): State<AppState>,
    Json(req): Json<GenerationRequest>,
) -> Result<Json<GenerationResponse>, Response> {
    let params = req.params(&state.defaults);
    let pipeline = state.pipeline.clone();
    let generation = tokio::task::spawn_blocking(move || pipeline.run(&req.prompt, &params))
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response())?
        .map_err(|e| ApiError(e).into_response())?;
    let response =
        GenerationResponse::from_generation(generation).map_err(|e| ApiError(e).into_response())?;
    Ok(Json(response))
}

fn router(pipeline: Pipeline, defaults: SamplingParams) -> Router {
    let state = AppState {
        pipeline: Arc::new(pipeline),
        defaults: Arc::new(defaults),
    };
    Router::new()
        .route("/v1/images/generations", post(generate_image_handler))
        .with_state(state)
}

pub async fn serve(pipeline: Pipeline, defaults: SamplingParams, bind_address: &str) -> Result<()> {
    let devices = pipeline.device_count();
    let app = router(pipeline, defaults);
    let listener = TcpListener::bind(bind_address).await?;
    info!(address = %listener.local_addr()?, devices, "started server");
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}
