use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::klcommon::{run_blocking, AppError, Candle, Liquidation};
use crate::kldata::status::StatusView;

use super::server::AppState;

/// 单次查询最多返回的K线数量
pub const MAX_CANDLES_PER_QUERY: usize = 1500;

/// 默认返回的K线数量
pub const DEFAULT_CANDLE_LIMIT: usize = 100;

/// 错误响应，只暴露分类与简要信息
pub struct ApiError(AppError);

impl From<AppError> for ApiError {
    fn from(e: AppError) -> Self {
        Self(e)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    details: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!(
            target: "状态服务",
            {
                error.summary = self.0.get_error_type_summary(),
                error.details = %self.0,
            },
            "查询失败"
        );
        let body = ErrorBody {
            error: self.0.get_error_type_summary(),
            details: self.0.to_string(),
        };
        (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct CandleQuery {
    pub limit: Option<usize>,
    pub since: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LiquidationQuery {
    pub since: Option<i64>,
}

#[derive(Serialize)]
pub struct CandleResponse {
    pub symbol: String,
    pub count: usize,
    pub data: Vec<Candle>,
}

#[derive(Serialize)]
pub struct LiquidationResponse {
    pub symbol: String,
    pub count: usize,
    pub data: Vec<Liquidation>,
}

/// `GET /api/status`
pub async fn status_handler(State(state): State<AppState>) -> Result<Json<StatusView>, ApiError> {
    let tracker = state.status.clone();
    Ok(Json(run_blocking(move || tracker.view()).await?))
}

/// `GET /api/candles?limit=N` 或 `?since=ts`，按时间升序
pub async fn candles_handler(
    State(state): State<AppState>,
    Query(query): Query<CandleQuery>,
) -> Result<Json<CandleResponse>, ApiError> {
    let db = state.db.clone();
    let data = match query.since {
        Some(since) => run_blocking(move || db.read_candles_since(since)).await?,
        None => {
            let limit = query.limit.unwrap_or(DEFAULT_CANDLE_LIMIT).clamp(1, MAX_CANDLES_PER_QUERY);
            run_blocking(move || db.read_recent_candles(limit)).await?
        }
    };

    Ok(Json(CandleResponse {
        symbol: state.symbol.to_string(),
        count: data.len(),
        data,
    }))
}

/// `GET /api/liquidations?since=ts`，缺省为全部
pub async fn liquidations_handler(
    State(state): State<AppState>,
    Query(query): Query<LiquidationQuery>,
) -> Result<Json<LiquidationResponse>, ApiError> {
    let db = state.db.clone();
    let since = query.since.unwrap_or(0);
    let data = run_blocking(move || db.read_liquidations_since(since)).await?;

    Ok(Json(LiquidationResponse {
        symbol: state.symbol.to_string(),
        count: data.len(),
        data,
    }))
}

/// `GET /health`
pub async fn health_handler() -> &'static str {
    "ok"
}
