use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use dexquote_builders::{
    assemble_unsigned_v0, serialize_and_encode, BuildParams, BuilderRegistry, TxEncoding,
};
use dexquote_cache::PriceCache;
use dexquote_config::ApiConfig;
use dexquote_core_types::{PriceObservation, TradeSide};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::fallback::PriceFallback;
use crate::rpc::RpcClient;

pub struct AppState {
    pub cache: Arc<PriceCache>,
    pub registry: Arc<BuilderRegistry>,
    pub fallback: PriceFallback,
    pub rpc: RpcClient,
    pub started_at: Instant,
}

pub async fn run_server(state: Arc<AppState>, api_config: &ApiConfig) -> anyhow::Result<()> {
    let app = build_router(state);
    let bind = format!("{}:{}", api_config.host, api_config.port);
    let listener = TcpListener::bind(&bind)
        .await
        .map_err(|error| anyhow::anyhow!("failed to bind api server on {bind}: {error}"))?;
    info!(bind = %bind, "api server started");
    axum::serve(listener, app)
        .await
        .map_err(|error| anyhow::anyhow!("api server failed: {error}"))
}

fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods(Any)
        .allow_headers(Any)
        .allow_origin(Any);
    Router::new()
        .route("/health", get(health))
        .route("/api/quote/{mint}", get(api_quote))
        .route("/api/swap/{mint}", post(api_swap))
        .layer(cors)
        .with_state(state)
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
    supported_protocols: Option<Vec<String>>,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            supported_protocols: None,
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
            supported_protocols: None,
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            supported_protocols: None,
        }
    }

    fn unsupported_protocol(program_id: &str, registry: &BuilderRegistry) -> Self {
        let mut supported: Vec<String> = registry
            .supported_program_ids()
            .into_iter()
            .collect();
        supported.sort();
        Self {
            status: StatusCode::BAD_REQUEST,
            message: format!("unsupported protocol: {program_id}"),
            supported_protocols: Some(supported),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "success": false,
            "error": self.message,
        });
        if let Some(supported) = self.supported_protocols {
            body["supportedProtocols"] = json!(supported);
        }
        (self.status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QuoteView {
    mint: String,
    pool: String,
    avg_price: f64,
    program_id: String,
    slot: String,
}

impl From<PriceObservation> for QuoteView {
    fn from(observation: PriceObservation) -> Self {
        Self {
            mint: observation.mint,
            pool: observation.pool,
            avg_price: observation.avg_price,
            program_id: observation.program_id,
            slot: observation.slot,
        }
    }
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
        "uptime": state.started_at.elapsed().as_secs_f64(),
    }))
}

async fn api_quote(
    State(state): State<Arc<AppState>>,
    Path(mint): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let observation = load_observation(&state, &mint)
        .await
        .ok_or_else(|| ApiError::not_found(format!("no price for mint {mint}")))?;
    Ok(Json(json!({
        "success": true,
        "quote": QuoteView::from(observation),
    })))
}

/// Cache first; on a miss or a non-positive cached price, ask the external
/// aggregator and write any admitted observation back into the cache.
async fn load_observation(state: &AppState, mint: &str) -> Option<PriceObservation> {
    if let Some(observation) = state.cache.get(mint) {
        if observation.avg_price > 0.0 && observation.avg_price.is_finite() {
            return Some(observation);
        }
    }
    let observation = state.fallback.lookup(mint, &state.registry).await?;
    state.cache.put(observation.clone());
    Some(observation)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SwapRequestBody {
    signer: Option<String>,
    #[serde(rename = "type")]
    side: Option<String>,
    amount_in: Option<f64>,
    amount_out: Option<f64>,
    slippage: Option<f64>,
    quote: Option<QuoteOverride>,
    encoding: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuoteOverride {
    mint: Option<String>,
    pool: Option<String>,
    avg_price: Option<f64>,
    program_id: Option<String>,
    slot: Option<Value>,
}

#[derive(Debug)]
struct ValidSwap {
    signer: String,
    side: TradeSide,
    amount_in: Option<u64>,
    amount_out: Option<u64>,
    slippage_bps: u64,
    encoding: TxEncoding,
    quote_override: Option<PriceObservation>,
}

const MIN_SLIPPAGE_BPS: f64 = 1_000.0;
const MAX_SLIPPAGE_BPS: f64 = 10_000.0;

fn validate_swap_request(
    path_mint: &str,
    body: &SwapRequestBody,
) -> Result<ValidSwap, ApiError> {
    let signer = body
        .signer
        .as_deref()
        .map(str::trim)
        .filter(|signer| !signer.is_empty())
        .ok_or_else(|| ApiError::bad_request("signer is required"))?;
    if signer.len() < 32 {
        return Err(ApiError::bad_request(
            "signer must be at least 32 characters",
        ));
    }

    let side = match body.side.as_deref().map(str::trim) {
        Some("buy") => TradeSide::Buy,
        Some("sell") => TradeSide::Sell,
        _ => return Err(ApiError::bad_request("type must be \"buy\" or \"sell\"")),
    };

    let (amount_in, amount_out) = match (body.amount_in, body.amount_out) {
        (Some(_), Some(_)) | (None, None) => {
            return Err(ApiError::bad_request(
                "exactly one of amountIn or amountOut is required",
            ))
        }
        (Some(amount), None) => (Some(validate_amount(amount, "amountIn")?), None),
        (None, Some(amount)) => (None, Some(validate_amount(amount, "amountOut")?)),
    };

    let slippage = body
        .slippage
        .ok_or_else(|| ApiError::bad_request("slippage is required"))?;
    if !slippage.is_finite() || !(MIN_SLIPPAGE_BPS..=MAX_SLIPPAGE_BPS).contains(&slippage) {
        return Err(ApiError::bad_request(
            "slippage must be between 1000 and 10000 basis points",
        ));
    }

    let encoding = match body.encoding.as_deref() {
        None => TxEncoding::Base64,
        Some(raw) => TxEncoding::parse(raw)
            .map_err(|_| ApiError::bad_request("encoding must be base64 or base58"))?,
    };

    let quote_override = body
        .quote
        .as_ref()
        .map(|quote| validate_quote_override(path_mint, quote))
        .transpose()?;

    Ok(ValidSwap {
        signer: signer.to_string(),
        side,
        amount_in,
        amount_out,
        slippage_bps: slippage as u64,
        encoding,
        quote_override,
    })
}

fn validate_amount(amount: f64, field: &str) -> Result<u64, ApiError> {
    if !amount.is_finite() || amount <= 0.0 {
        return Err(ApiError::bad_request(format!(
            "{field} must be a positive number"
        )));
    }
    if amount > u64::MAX as f64 {
        return Err(ApiError::bad_request(format!("{field} is out of range")));
    }
    Ok(amount as u64)
}

fn validate_quote_override(
    path_mint: &str,
    quote: &QuoteOverride,
) -> Result<PriceObservation, ApiError> {
    let mint = quote
        .mint
        .as_deref()
        .filter(|mint| *mint == path_mint)
        .ok_or_else(|| ApiError::bad_request("quote.mint must match the requested mint"))?;
    let pool = quote
        .pool
        .as_deref()
        .map(str::trim)
        .filter(|pool| !pool.is_empty())
        .ok_or_else(|| ApiError::bad_request("quote.pool is required"))?;
    let avg_price = quote
        .avg_price
        .filter(|price| price.is_finite() && *price > 0.0)
        .ok_or_else(|| ApiError::bad_request("quote.avgPrice must be positive"))?;
    let program_id = quote
        .program_id
        .as_deref()
        .map(str::trim)
        .filter(|program| !program.is_empty())
        .ok_or_else(|| ApiError::bad_request("quote.programId is required"))?;
    let slot = match quote.slot.as_ref() {
        Some(Value::String(slot)) if !slot.trim().is_empty() => slot.trim().to_string(),
        Some(Value::Number(slot)) => slot.to_string(),
        _ => return Err(ApiError::bad_request("quote.slot is required")),
    };

    let now_ms = Utc::now().timestamp_millis();
    Ok(PriceObservation {
        mint: mint.to_string(),
        pool: pool.to_string(),
        avg_price,
        program_id: program_id.to_string(),
        slot,
        stored_at_ms: now_ms,
        last_access_ms: now_ms,
    })
}

async fn api_swap(
    State(state): State<Arc<AppState>>,
    Path(mint): Path<String>,
    Json(body): Json<SwapRequestBody>,
) -> Result<Json<Value>, ApiError> {
    let valid = validate_swap_request(&mint, &body)?;

    let observation = match valid.quote_override {
        Some(observation) => observation,
        None => state
            .cache
            .get(&mint)
            .filter(|observation| {
                observation.avg_price > 0.0 && observation.avg_price.is_finite()
            })
            .ok_or_else(|| ApiError::not_found(format!("no price for mint {mint}")))?,
    };

    if !state.registry.has_builder(&observation.program_id) {
        return Err(ApiError::unsupported_protocol(
            &observation.program_id,
            &state.registry,
        ));
    }

    let params = BuildParams {
        mint: &mint,
        signer: &valid.signer,
        side: valid.side,
        input_amount: valid.amount_in,
        output_amount: valid.amount_out,
        slippage_bps: valid.slippage_bps,
        observation: &observation,
    };
    let instructions = state
        .registry
        .build(&observation.program_id, &params)
        .map_err(|build_error| {
            error!(mint = %mint, error = %build_error, "swap builder failed");
            ApiError::internal("failed to build swap transaction")
        })?;

    let blockhash = state.rpc.latest_blockhash().await.map_err(|rpc_error| {
        error!(error = %rpc_error, "blockhash fetch failed");
        ApiError::internal("failed to prepare transaction")
    })?;

    let transaction = assemble_unsigned_v0(&valid.signer, &instructions, blockhash)
        .map_err(|assemble_error| {
            error!(error = %assemble_error, "transaction assembly failed");
            ApiError::internal("failed to assemble transaction")
        })?;
    let encoded = serialize_and_encode(&transaction, valid.encoding).map_err(|encode_error| {
        error!(error = %encode_error, "transaction encoding failed");
        ApiError::internal("failed to encode transaction")
    })?;

    Ok(Json(json!({
        "success": true,
        "tx": encoded,
    })))
}
