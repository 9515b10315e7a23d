/// 경매 레코드 조회
pub const GET_AUCTION: &str = "SELECT item_id, seller, min_price, highest_bid, highest_bidder, escrow_id, end_time, ended, metadata_uri, created_at FROM auctions WHERE item_id = $1";

/// 모든 경매 조회
pub const GET_ALL_AUCTIONS: &str = "SELECT item_id, seller, min_price, highest_bid, highest_bidder, escrow_id, end_time, ended, metadata_uri, created_at FROM auctions ORDER BY created_at DESC";

/// 최고 입찰가 조회 (커밋된 레코드 기준)
pub const GET_HIGHEST_BID: &str = "SELECT highest_bid FROM auctions WHERE item_id = $1";

/// 입찰 이력 조회 (프로젝션)
pub const GET_BID_HISTORY: &str = r#"
    SELECT id, item_id, bidder, bid_amount, escrow_id, bid_time
    FROM bids
    WHERE item_id = $1
    ORDER BY bid_time DESC
"#;

/// 아이템 이벤트 버전 조회
pub const GET_ITEM_VERSION: &str = "SELECT COALESCE(MAX(version), 0) as version FROM events WHERE aggregate_id = $1";
