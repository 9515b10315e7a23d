/// 경매 레지스트리 커맨드 처리
/// 1. 경매 시작
/// 2. 입찰
/// 3. 정산
/// 4. 취소 (입찰 전)
///
/// item_id 당 하나의 레코드만 레지스트리가 소유하며, 모든 변경은
/// 이벤트 (aggregate_id, version) 유니크 제약으로 직렬화된다.
/// 충돌한 커맨드는 롤백 후 최신 상태를 다시 읽어 재시도한다.
// region:    --- Imports
use crate::auction::error::AuctionError;
use crate::auction::events::AuctionEvent;
use crate::auction::model::{AuctionRecord, SettlementResult};
use crate::custody::{
    enqueue_movement, CustodyError, EscrowError, FundsEscrow, ItemCustody,
};
use crate::database::DatabaseManager;
use crate::event_store::{Event, EventStore};
use crate::query::handlers::{get_auction, get_item_version};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
// endregion: --- Imports

// region:    --- Commands
/// 경매 시작 명령
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StartAuctionCommand {
    pub item_id: i64,
    pub seller: String,
    pub min_price: i64,
    pub duration_secs: i64,
    pub metadata_uri: String,
}

/// 입찰 명령
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PlaceBidCommand {
    pub item_id: i64,
    pub bidder: String,
    pub bid_amount: i64,
}

// 버전 충돌 시 최대 재시도 횟수
const MAX_RETRIES: i32 = 100;

// endregion: --- Commands

// region:    --- Policy

/// 스나이핑 방지 정책
/// 마감 window초 전 입찰이 수락되면 마감을 extension초 연장한다. 0이면 비활성.
#[derive(Debug, Clone, Copy)]
pub struct AuctionPolicy {
    pub anti_snipe_window_secs: i64,
    pub anti_snipe_extension_secs: i64,
}

impl AuctionPolicy {
    pub fn disabled() -> Self {
        Self {
            anti_snipe_window_secs: 0,
            anti_snipe_extension_secs: 0,
        }
    }

    /// ANTI_SNIPE_WINDOW_SECS / ANTI_SNIPE_EXTENSION_SECS 환경변수로 생성
    pub fn from_env() -> Self {
        let window = std::env::var("ANTI_SNIPE_WINDOW_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let extension = std::env::var("ANTI_SNIPE_EXTENSION_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        Self {
            anti_snipe_window_secs: window,
            anti_snipe_extension_secs: extension,
        }
    }

    /// 연장 여부 판단, 연장 시 새 마감 시각 반환
    pub fn maybe_extend(
        &self,
        now: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        if self.anti_snipe_window_secs <= 0 || self.anti_snipe_extension_secs <= 0 {
            return None;
        }
        if end_time - now < Duration::seconds(self.anti_snipe_window_secs) {
            Some(end_time + Duration::seconds(self.anti_snipe_extension_secs))
        } else {
            None
        }
    }
}

// endregion: --- Policy

// region:    --- Preconditions

/// 입찰 사전조건 검사 (상태 변경 없음)
pub fn check_bid(
    record: &AuctionRecord,
    now: DateTime<Utc>,
    bidder: &str,
    amount: i64,
) -> Result<(), AuctionError> {
    if record.ended {
        return Err(AuctionError::AuctionEnded);
    }
    if now >= record.end_time {
        return Err(AuctionError::AuctionExpired);
    }
    if bidder == record.seller {
        return Err(AuctionError::SelfBid);
    }
    // 최소가 이상, 현재 최고가 초과 (동액 불가)
    if amount < record.min_price || amount <= record.highest_bid {
        return Err(AuctionError::BidTooLow {
            bid: amount,
            floor: record.bid_floor(),
        });
    }
    Ok(())
}

/// 정산 사전조건 검사
pub fn check_settle(record: &AuctionRecord, now: DateTime<Utc>) -> Result<(), AuctionError> {
    if record.ended {
        return Err(AuctionError::AlreadySettled);
    }
    if now < record.end_time {
        return Err(AuctionError::AuctionNotYetEnded);
    }
    Ok(())
}

/// 취소 사전조건 검사 (입찰이 하나라도 있으면 불가)
pub fn check_cancel(
    record: &AuctionRecord,
    now: DateTime<Utc>,
    caller: &str,
) -> Result<(), AuctionError> {
    if record.ended {
        return Err(AuctionError::AuctionEnded);
    }
    if caller != record.seller {
        return Err(AuctionError::NotAuthorized);
    }
    if record.highest_bid > 0 {
        return Err(AuctionError::AlreadyBid);
    }
    if now >= record.end_time {
        return Err(AuctionError::AuctionExpired);
    }
    Ok(())
}

// endregion: --- Preconditions

// region:    --- Command Handlers

/// 1. 경매 시작
/// 잠금이 성공한 뒤에만 레코드를 커밋한다. 커밋 실패 시 잠금을 되돌린다.
pub async fn handle_start_auction(
    cmd: StartAuctionCommand,
    event_store: &impl EventStore,
    custody: &impl ItemCustody,
    db_manager: &DatabaseManager,
) -> Result<AuctionRecord, AuctionError> {
    info!("{:<12} --> 경매 시작 요청 처리: {:?}", "Command", cmd);

    if cmd.min_price <= 0 {
        return Err(AuctionError::InvalidParameters(
            "min_price는 0보다 커야 합니다".to_string(),
        ));
    }
    if cmd.duration_secs <= 0 {
        return Err(AuctionError::InvalidParameters(
            "duration_secs는 0보다 커야 합니다".to_string(),
        ));
    }

    let mut retries = 0;
    while retries < MAX_RETRIES {
        let current_version = get_item_version(db_manager, cmd.item_id).await?;
        if let Some(existing) = get_auction(db_manager, cmd.item_id).await? {
            if !existing.ended {
                return Err(AuctionError::AlreadyListed);
            }
        }

        let now = Utc::now();
        let record = AuctionRecord {
            item_id: cmd.item_id,
            seller: cmd.seller.clone(),
            min_price: cmd.min_price,
            highest_bid: 0,
            highest_bidder: None,
            escrow_id: None,
            end_time: now + Duration::seconds(cmd.duration_secs),
            ended: false,
            metadata_uri: cmd.metadata_uri.clone(),
            created_at: now,
        };

        // 잠금 실패 시 레코드는 만들어지지 않는다
        custody
            .lock(cmd.item_id, &cmd.seller)
            .await
            .map_err(|e| match e {
                CustodyError::NotOwner => AuctionError::NotAuthorized,
                other => AuctionError::CustodyFailure(other.to_string()),
            })?;

        let auction_event = AuctionEvent::AuctionStarted {
            item_id: record.item_id,
            seller: record.seller.clone(),
            min_price: record.min_price,
            end_time: record.end_time,
            metadata_uri: record.metadata_uri.clone(),
            timestamp: now,
        };
        let event = Event::from_auction_event(cmd.item_id, current_version + 1, &auction_event)
            .map_err(|e| AuctionError::Internal(e.to_string()))?;

        let mut tx = db_manager.pool().begin().await?;
        if event_store.append_event(&mut tx, &event).await?.is_none() {
            tx.rollback().await?;
            revert_lock(custody, db_manager, cmd.item_id, &cmd.seller).await;
            retries += 1;
            continue;
        }

        // 종료된 기존 레코드만 대체 가능
        let rows = sqlx::query(
            "INSERT INTO auctions
                (item_id, seller, min_price, highest_bid, highest_bidder, escrow_id,
                 end_time, ended, metadata_uri, created_at)
             VALUES ($1, $2, $3, 0, NULL, NULL, $4, false, $5, $6)
             ON CONFLICT (item_id) DO UPDATE SET
                seller = $2, min_price = $3, highest_bid = 0, highest_bidder = NULL,
                escrow_id = NULL, end_time = $4, ended = false, metadata_uri = $5,
                created_at = $6
             WHERE auctions.ended = true",
        )
        .bind(record.item_id)
        .bind(&record.seller)
        .bind(record.min_price)
        .bind(record.end_time)
        .bind(&record.metadata_uri)
        .bind(record.created_at)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if rows == 0 {
            // 동시 등록 경합에서 패배
            tx.rollback().await?;
            revert_lock(custody, db_manager, cmd.item_id, &cmd.seller).await;
            retries += 1;
            continue;
        }

        tx.commit().await?;
        event_store.publish_event(&event).await;
        info!(
            "{:<12} --> 경매 시작: item={}, min_price={}, end_time={}",
            "Command", record.item_id, record.min_price, record.end_time
        );
        return Ok(record);
    }

    Err(AuctionError::MaxRetriesExceeded)
}

/// 2. 입찰
/// 예치가 선행되고, 커밋 이후 직전 최고 입찰자를 환불한다.
/// 환불 실패는 새 입찰을 막지 않는다 (정합성 큐에서 재시도).
pub async fn handle_place_bid(
    cmd: PlaceBidCommand,
    event_store: &impl EventStore,
    escrow: &impl FundsEscrow,
    db_manager: &DatabaseManager,
    policy: &AuctionPolicy,
) -> Result<AuctionRecord, AuctionError> {
    info!("{:<12} --> 입찰 요청 처리: {:?}", "Command", cmd);

    let mut retries = 0;
    while retries < MAX_RETRIES {
        let current_version = get_item_version(db_manager, cmd.item_id).await?;
        let record = get_auction(db_manager, cmd.item_id)
            .await?
            .ok_or(AuctionError::AuctionNotFound(cmd.item_id))?;

        let now = Utc::now();
        check_bid(&record, now, &cmd.bidder, cmd.bid_amount)?;

        // 예치 실패 시 아무것도 커밋되지 않는다
        let escrow_id = escrow
            .escrow(&cmd.bidder, cmd.bid_amount)
            .await
            .map_err(|e| match e {
                EscrowError::InsufficientFunds => AuctionError::InsufficientFunds,
                other => AuctionError::CustodyFailure(other.to_string()),
            })?;

        let new_end_time = policy.maybe_extend(now, record.end_time);
        let auction_event = AuctionEvent::BidPlaced {
            item_id: cmd.item_id,
            bidder: cmd.bidder.clone(),
            bid_amount: cmd.bid_amount,
            escrow_id: escrow_id.clone(),
            new_end_time,
            timestamp: now,
        };
        let event = Event::from_auction_event(cmd.item_id, current_version + 1, &auction_event)
            .map_err(|e| AuctionError::Internal(e.to_string()))?;

        let end_time = new_end_time.unwrap_or(record.end_time);
        let mut tx = db_manager.pool().begin().await?;
        if event_store.append_event(&mut tx, &event).await?.is_none() {
            tx.rollback().await?;
            revert_escrow(escrow, db_manager, cmd.item_id, &escrow_id, &cmd.bidder).await;
            warn!(
                "{:<12} --> 낙관적 업데이트로 인한 버전 충돌: 재시도",
                "Command"
            );
            retries += 1;
            continue;
        }

        // 검증 이후의 경합 변경을 방어
        let rows = sqlx::query(
            "UPDATE auctions
             SET highest_bid = $2, highest_bidder = $3, escrow_id = $4, end_time = $5
             WHERE item_id = $1 AND ended = false AND highest_bid < $2",
        )
        .bind(cmd.item_id)
        .bind(cmd.bid_amount)
        .bind(&cmd.bidder)
        .bind(&escrow_id)
        .bind(end_time)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if rows == 0 {
            tx.rollback().await?;
            revert_escrow(escrow, db_manager, cmd.item_id, &escrow_id, &cmd.bidder).await;
            retries += 1;
            continue;
        }

        tx.commit().await?;
        event_store.publish_event(&event).await;

        // 직전 최고 입찰자 환불, 새 입찰 수락은 이미 확정됨
        if let (Some(prev_bidder), Some(prev_escrow)) =
            (record.highest_bidder.as_deref(), record.escrow_id.as_deref())
        {
            if let Err(e) = escrow.refund(prev_escrow).await {
                warn!(
                    "{:<12} --> 직전 입찰자 환불 실패: item={}, bidder={}, err={}",
                    "Command", cmd.item_id, prev_bidder, e
                );
                enqueue_movement(
                    db_manager.pool(),
                    cmd.item_id,
                    "refund",
                    Some(prev_escrow),
                    Some(prev_bidder),
                )
                .await;
            }
        }

        info!(
            "{:<12} --> 입찰 수락: item={}, amount={}, bidder={}",
            "Command", cmd.item_id, cmd.bid_amount, cmd.bidder
        );
        return Ok(AuctionRecord {
            highest_bid: cmd.bid_amount,
            highest_bidder: Some(cmd.bidder.clone()),
            escrow_id: Some(escrow_id),
            end_time,
            ..record
        });
    }

    Err(AuctionError::MaxRetriesExceeded)
}

/// 3. 정산
/// ended 커밋이 외부 이동보다 먼저다. 커밋은 정확히 한 번만 성공하고,
/// 이후 호출은 모두 AlreadySettled로 실패하며 추가 이동은 없다.
pub async fn handle_settle(
    item_id: i64,
    event_store: &impl EventStore,
    custody: &impl ItemCustody,
    escrow: &impl FundsEscrow,
    db_manager: &DatabaseManager,
) -> Result<SettlementResult, AuctionError> {
    info!("{:<12} --> 정산 요청 처리: item={}", "Command", item_id);

    let mut retries = 0;
    while retries < MAX_RETRIES {
        let current_version = get_item_version(db_manager, item_id).await?;
        let record = get_auction(db_manager, item_id)
            .await?
            .ok_or(AuctionError::AuctionNotFound(item_id))?;

        let now = Utc::now();
        check_settle(&record, now)?;

        let auction_event = AuctionEvent::AuctionSettled {
            item_id,
            winner: record.highest_bidder.clone(),
            winning_bid: record.highest_bid,
            timestamp: now,
        };
        let event = Event::from_auction_event(item_id, current_version + 1, &auction_event)
            .map_err(|e| AuctionError::Internal(e.to_string()))?;

        let mut tx = db_manager.pool().begin().await?;
        if event_store.append_event(&mut tx, &event).await?.is_none() {
            tx.rollback().await?;
            retries += 1;
            continue;
        }

        let rows = sqlx::query("UPDATE auctions SET ended = true WHERE item_id = $1 AND ended = false")
            .bind(item_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if rows == 0 {
            tx.rollback().await?;
            retries += 1;
            continue;
        }

        tx.commit().await?;
        event_store.publish_event(&event).await;

        // 상태 커밋 이후의 자금/아이템 이동, 실패 시 정합성 큐로
        let mut movement_failure: Option<String> = None;
        match (record.highest_bidder.as_deref(), record.escrow_id.as_deref()) {
            (Some(winner), Some(escrow_id)) => {
                if let Err(e) = escrow.release(escrow_id, &record.seller).await {
                    enqueue_movement(
                        db_manager.pool(),
                        item_id,
                        "release",
                        Some(escrow_id),
                        Some(record.seller.as_str()),
                    )
                    .await;
                    movement_failure = Some(e.to_string());
                }
                if let Err(e) = custody.transfer(item_id, winner).await {
                    enqueue_movement(db_manager.pool(), item_id, "transfer", None, Some(winner))
                        .await;
                    movement_failure = Some(e.to_string());
                }
            }
            _ => {
                // 유찰: 아이템만 판매자에게 반환
                if let Err(e) = custody.unlock(item_id).await {
                    enqueue_movement(
                        db_manager.pool(),
                        item_id,
                        "unlock",
                        None,
                        Some(record.seller.as_str()),
                    )
                    .await;
                    movement_failure = Some(e.to_string());
                }
            }
        }

        if let Some(msg) = movement_failure {
            return Err(AuctionError::CustodyFailure(msg));
        }

        info!(
            "{:<12} --> 정산 완료: item={}, winner={:?}, winning_bid={}",
            "Command", item_id, record.highest_bidder, record.highest_bid
        );
        return Ok(SettlementResult {
            item_id,
            seller: record.seller,
            winner: record.highest_bidder,
            winning_bid: record.highest_bid,
            settled_at: now,
        });
    }

    Err(AuctionError::MaxRetriesExceeded)
}

/// 4. 취소 (입찰 전)
/// 입찰이 하나라도 존재하면 거부한다.
pub async fn handle_cancel_if_unstarted(
    item_id: i64,
    caller: &str,
    event_store: &impl EventStore,
    custody: &impl ItemCustody,
    db_manager: &DatabaseManager,
) -> Result<(), AuctionError> {
    info!(
        "{:<12} --> 취소 요청 처리: item={}, caller={}",
        "Command", item_id, caller
    );

    let mut retries = 0;
    while retries < MAX_RETRIES {
        let current_version = get_item_version(db_manager, item_id).await?;
        let record = get_auction(db_manager, item_id)
            .await?
            .ok_or(AuctionError::AuctionNotFound(item_id))?;

        let now = Utc::now();
        check_cancel(&record, now, caller)?;

        let auction_event = AuctionEvent::AuctionCancelled { item_id, timestamp: now };
        let event = Event::from_auction_event(item_id, current_version + 1, &auction_event)
            .map_err(|e| AuctionError::Internal(e.to_string()))?;

        let mut tx = db_manager.pool().begin().await?;
        if event_store.append_event(&mut tx, &event).await?.is_none() {
            tx.rollback().await?;
            retries += 1;
            continue;
        }

        let rows = sqlx::query(
            "UPDATE auctions SET ended = true
             WHERE item_id = $1 AND ended = false AND highest_bid = 0",
        )
        .bind(item_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if rows == 0 {
            tx.rollback().await?;
            retries += 1;
            continue;
        }

        tx.commit().await?;
        event_store.publish_event(&event).await;

        if let Err(e) = custody.unlock(item_id).await {
            enqueue_movement(db_manager.pool(), item_id, "unlock", None, Some(record.seller.as_str()))
                .await;
            return Err(AuctionError::CustodyFailure(e.to_string()));
        }

        info!("{:<12} --> 경매 취소: item={}", "Command", item_id);
        return Ok(());
    }

    Err(AuctionError::MaxRetriesExceeded)
}

// endregion: --- Command Handlers

// region:    --- Compensation

/// 커밋 실패 후 잠금 해제 (실패 시 정합성 큐로)
async fn revert_lock(
    custody: &impl ItemCustody,
    db_manager: &DatabaseManager,
    item_id: i64,
    seller: &str,
) {
    if let Err(e) = custody.unlock(item_id).await {
        warn!(
            "{:<12} --> 잠금 되돌리기 실패: item={}, err={}",
            "Command", item_id, e
        );
        enqueue_movement(db_manager.pool(), item_id, "unlock", None, Some(seller)).await;
    }
}

/// 커밋 실패 후 새 예치 환불 (실패 시 정합성 큐로)
async fn revert_escrow(
    escrow: &impl FundsEscrow,
    db_manager: &DatabaseManager,
    item_id: i64,
    escrow_id: &str,
    bidder: &str,
) {
    if let Err(e) = escrow.refund(escrow_id).await {
        warn!(
            "{:<12} --> 예치 되돌리기 실패: item={}, escrow={}, err={}",
            "Command", item_id, escrow_id, e
        );
        enqueue_movement(
            db_manager.pool(),
            item_id,
            "refund",
            Some(escrow_id),
            Some(bidder),
        )
        .await;
    }
}

// endregion: --- Compensation

// region:    --- Tests


// endregion: --- Tests
