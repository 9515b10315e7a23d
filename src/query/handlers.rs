// region:    --- Imports
use super::queries;
use crate::auction::model::{AuctionRecord, Bid};
use crate::database::DatabaseManager;
use sqlx::Error as SqlxError;
use sqlx::Row;
use tracing::info;

// endregion: --- Imports

// region:    --- Query Handlers

/// 경매 레코드 조회 (없으면 None)
pub async fn get_auction(
    db_manager: &DatabaseManager,
    item_id: i64,
) -> Result<Option<AuctionRecord>, SqlxError> {
    db_manager
        .transaction(|tx| {
            Box::pin(async move {
                sqlx::query_as::<_, AuctionRecord>(queries::GET_AUCTION)
                    .bind(item_id)
                    .fetch_optional(&mut **tx)
                    .await
            })
        })
        .await
}

/// 모든 경매 조회
pub async fn get_all_auctions(
    db_manager: &DatabaseManager,
) -> Result<Vec<AuctionRecord>, SqlxError> {
    info!("{:<12} --> 모든 경매 조회", "Query");
    db_manager
        .transaction(|tx| {
            Box::pin(async move {
                sqlx::query_as::<_, AuctionRecord>(queries::GET_ALL_AUCTIONS)
                    .fetch_all(&mut **tx)
                    .await
            })
        })
        .await
}

/// 최고 입찰가 조회 (입찰 없으면 0)
pub async fn get_highest_bid(
    db_manager: &DatabaseManager,
    item_id: i64,
) -> Result<Option<i64>, SqlxError> {
    info!("{:<12} --> 최고 입찰가 조회 id: {}", "Query", item_id);
    db_manager
        .transaction(|tx| {
            Box::pin(async move {
                let row = sqlx::query(queries::GET_HIGHEST_BID)
                    .bind(item_id)
                    .fetch_optional(&mut **tx)
                    .await?;

                Ok(row.map(|r| r.get("highest_bid")))
            })
        })
        .await
}

/// 입찰 이력 조회
pub async fn get_bid_history(
    db_manager: &DatabaseManager,
    item_id: i64,
) -> Result<Vec<Bid>, SqlxError> {
    info!("{:<12} --> 입찰 이력 조회 id: {}", "Query", item_id);
    db_manager
        .transaction(|tx| {
            Box::pin(async move {
                sqlx::query_as::<_, Bid>(queries::GET_BID_HISTORY)
                    .bind(item_id)
                    .fetch_all(&mut **tx)
                    .await
            })
        })
        .await
}

/// 아이템 이벤트 버전 조회
pub async fn get_item_version(
    db_manager: &DatabaseManager,
    item_id: i64,
) -> Result<i64, SqlxError> {
    db_manager
        .transaction(|tx| {
            Box::pin(async move {
                let result = sqlx::query(queries::GET_ITEM_VERSION)
                    .bind(item_id)
                    .fetch_one(&mut **tx)
                    .await?;

                Ok(result.get("version"))
            })
        })
        .await
}

// endregion: --- Query Handlers
