// region:    --- Imports
use crate::auction::error::AuctionError;
use crate::custody::{HttpFundsEscrow, HttpItemCustody};
use crate::database::DatabaseManager;
use crate::event_store::PostgresEventStore;
use crate::message_broker::KafkaProducer;
use crate::query;
use crate::registry::commands::{
    handle_cancel_if_unstarted as command_handle_cancel, handle_place_bid, handle_settle,
    handle_start_auction as command_handle_start_auction, AuctionPolicy, PlaceBidCommand,
    StartAuctionCommand,
};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

// endregion: --- Imports

// region:    --- App State

#[derive(Clone)]
pub struct AppState {
    pub db_manager: Arc<DatabaseManager>,
    pub kafka_producer: Arc<KafkaProducer>,
    pub custody: Arc<HttpItemCustody>,
    pub escrow: Arc<HttpFundsEscrow>,
    pub policy: AuctionPolicy,
}

// endregion: --- App State

// region:    --- Error Mapping

/// 도메인 오류를 HTTP 응답으로 변환
fn error_response(e: AuctionError) -> Response {
    let status = match e {
        AuctionError::AuctionNotFound(_) => StatusCode::NOT_FOUND,
        AuctionError::CustodyFailure(_) => StatusCode::BAD_GATEWAY,
        AuctionError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_REQUEST,
    };
    (
        status,
        Json(serde_json::json!({
            "error": e.to_string(),
            "code": e.code()
        })),
    )
        .into_response()
}

// endregion: --- Error Mapping

// region:    --- Command Handlers

/// 경매 시작 요청 처리
pub async fn handle_start_auction(
    State(state): State<AppState>,
    Json(cmd): Json<StartAuctionCommand>,
) -> impl IntoResponse {
    info!("{:<12} --> 경매 시작 요청: {:?}", "Handler", cmd);

    let event_store = PostgresEventStore::new(Arc::clone(&state.kafka_producer));
    match command_handle_start_auction(cmd, &event_store, &*state.custody, &state.db_manager).await
    {
        Ok(record) => (StatusCode::CREATED, Json(record)).into_response(),
        Err(e) => error_response(e),
    }
}

/// 입찰 요청 처리
pub async fn handle_bid(
    State(state): State<AppState>,
    Json(cmd): Json<PlaceBidCommand>,
) -> impl IntoResponse {
    info!("{:<12} --> 입찰 요청: {:?}", "Handler", cmd);

    let event_store = PostgresEventStore::new(Arc::clone(&state.kafka_producer));
    match handle_place_bid(
        cmd,
        &event_store,
        &*state.escrow,
        &state.db_manager,
        &state.policy,
    )
    .await
    {
        Ok(record) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "message": "입찰이 성공적으로 처리되었습니다.",
                "current_price": record.highest_bid,
                "end_time": record.end_time
            })),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

/// 정산 요청 처리
pub async fn handle_settle_auction(
    State(state): State<AppState>,
    Path(item_id): Path<i64>,
) -> impl IntoResponse {
    info!("{:<12} --> 정산 요청: item={}", "Handler", item_id);

    let event_store = PostgresEventStore::new(Arc::clone(&state.kafka_producer));
    match handle_settle(
        item_id,
        &event_store,
        &*state.custody,
        &*state.escrow,
        &state.db_manager,
    )
    .await
    {
        Ok(result) => Json(result).into_response(),
        Err(e) => error_response(e),
    }
}

/// 취소 요청 바디
#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub caller: String,
}

/// 취소 요청 처리 (입찰 전)
pub async fn handle_cancel_auction(
    State(state): State<AppState>,
    Path(item_id): Path<i64>,
    Json(req): Json<CancelRequest>,
) -> impl IntoResponse {
    info!(
        "{:<12} --> 취소 요청: item={}, caller={}",
        "Handler", item_id, req.caller
    );

    let event_store = PostgresEventStore::new(Arc::clone(&state.kafka_producer));
    match command_handle_cancel(
        item_id,
        &req.caller,
        &event_store,
        &*state.custody,
        &state.db_manager,
    )
    .await
    {
        Ok(_) => (
            StatusCode::OK,
            Json(serde_json::json!({ "message": "경매가 취소되었습니다." })),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

// endregion: --- Command Handlers

// region:    --- Query Handlers

/// 경매 레코드 조회
pub async fn handle_get_auction(
    State(state): State<AppState>,
    Path(item_id): Path<i64>,
) -> impl IntoResponse {
    info!("{:<12} --> 경매 조회 id: {}", "HandlerQuery", item_id);
    match query::handlers::get_auction(&state.db_manager, item_id).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => error_response(AuctionError::AuctionNotFound(item_id)),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// 모든 경매 조회
pub async fn handle_get_auctions(State(state): State<AppState>) -> impl IntoResponse {
    info!("{:<12} --> 모든 경매 조회", "HandlerQuery");
    match query::handlers::get_all_auctions(&state.db_manager).await {
        Ok(records) => Json(records).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// 최고 입찰가 조회
pub async fn handle_get_highest_bid(
    State(state): State<AppState>,
    Path(item_id): Path<i64>,
) -> impl IntoResponse {
    info!(
        "{:<12} --> 최고 입찰가 조회 id: {}",
        "HandlerQuery", item_id
    );
    match query::handlers::get_highest_bid(&state.db_manager, item_id).await {
        Ok(Some(bid)) => Json(serde_json::json!({ "highest_bid": bid })).into_response(),
        Ok(None) => error_response(AuctionError::AuctionNotFound(item_id)),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// 입찰 이력 조회
pub async fn handle_get_bid_history(
    State(state): State<AppState>,
    Path(item_id): Path<i64>,
) -> impl IntoResponse {
    info!("{:<12} --> 입찰 이력 조회 id: {}", "HandlerQuery", item_id);
    match query::handlers::get_bid_history(&state.db_manager, item_id).await {
        Ok(history) => Json(history).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

// endregion: --- Query Handlers
