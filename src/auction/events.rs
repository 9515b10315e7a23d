use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum AuctionEvent {
    // 경매 시작 이벤트
    AuctionStarted {
        item_id: i64,
        seller: String,
        min_price: i64,
        end_time: DateTime<Utc>,
        metadata_uri: String,
        timestamp: DateTime<Utc>,
    },
    // 입찰 이벤트 (스나이핑 방지 연장 시 new_end_time 포함)
    BidPlaced {
        item_id: i64,
        bidder: String,
        bid_amount: i64,
        escrow_id: String,
        new_end_time: Option<DateTime<Utc>>,
        timestamp: DateTime<Utc>,
    },
    // 정산 이벤트
    AuctionSettled {
        item_id: i64,
        winner: Option<String>,
        winning_bid: i64,
        timestamp: DateTime<Utc>,
    },
    // 취소 이벤트 (입찰 전 판매자 취소)
    AuctionCancelled {
        item_id: i64,
        timestamp: DateTime<Utc>,
    },
}

impl AuctionEvent {
    /// 이벤트 저장소의 event_type 문자열
    pub fn event_type(&self) -> &'static str {
        match self {
            AuctionEvent::AuctionStarted { .. } => "AuctionStarted",
            AuctionEvent::BidPlaced { .. } => "BidPlaced",
            AuctionEvent::AuctionSettled { .. } => "AuctionSettled",
            AuctionEvent::AuctionCancelled { .. } => "AuctionCancelled",
        }
    }
}
