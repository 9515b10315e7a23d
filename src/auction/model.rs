use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// 경매 레코드 모델 (item_id 당 1개)
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuctionRecord {
    pub item_id: i64,
    pub seller: String,
    pub min_price: i64,
    pub highest_bid: i64,
    pub highest_bidder: Option<String>,
    pub escrow_id: Option<String>,
    pub end_time: DateTime<Utc>,
    pub ended: bool,
    pub metadata_uri: String,
    pub created_at: DateTime<Utc>,
}

impl AuctionRecord {
    /// 입찰 수락 하한가 (첫 입찰은 최소가, 이후는 최고가 초과)
    pub fn bid_floor(&self) -> i64 {
        if self.highest_bid == 0 {
            self.min_price
        } else {
            self.highest_bid + 1
        }
    }
}

// 입찰 이력 모델 (이벤트 프로젝션)
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow)]
pub struct Bid {
    pub id: i64,
    pub item_id: i64,
    pub bidder: String,
    pub bid_amount: i64,
    pub escrow_id: String,
    pub bid_time: DateTime<Utc>,
}

/// 정산 결과
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementResult {
    pub item_id: i64,
    pub seller: String,
    pub winner: Option<String>,
    pub winning_bid: i64,
    pub settled_at: DateTime<Utc>,
}
