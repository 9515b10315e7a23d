use async_trait::async_trait;
use chrono::Utc;
use nft_auction_service::auction::error::AuctionError;
use nft_auction_service::custody::{CustodyError, EscrowError, FundsEscrow, ItemCustody};
use nft_auction_service::database::DatabaseManager;
use nft_auction_service::event_store::{Event, EventStore};
use nft_auction_service::query;
use nft_auction_service::registry::commands::{
    handle_cancel_if_unstarted, handle_place_bid, handle_settle, handle_start_auction,
    AuctionPolicy, PlaceBidCommand, StartAuctionCommand,
};
use sqlx::{Postgres, Row, Transaction};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use tracing::info;

/// 트레이싱 초기화
fn init_tracing() {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .without_time()
        .with_target(false)
        .with_test_writer()
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

static SCHEMA: OnceCell<()> = OnceCell::const_new();

/// 데이터베이스 매니저 설정 (스키마는 프로세스당 1회 초기화)
async fn setup() -> Arc<DatabaseManager> {
    let db_manager = Arc::new(DatabaseManager::new().await);
    let db = Arc::clone(&db_manager);
    SCHEMA
        .get_or_init(|| async move {
            db.initialize_database()
                .await
                .expect("스키마 초기화 실패");
        })
        .await;
    db_manager
}

// region:    --- Test Doubles

/// Kafka 없이 이벤트만 적재하는 저장소
struct TestEventStore;

#[async_trait]
impl EventStore for TestEventStore {
    async fn append_event(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &Event,
    ) -> Result<Option<i64>, sqlx::Error> {
        sqlx::query_scalar::<_, i64>(
            "INSERT INTO events (aggregate_id, event_type, data, timestamp, version)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (aggregate_id, version) DO NOTHING
            RETURNING id",
        )
        .bind(event.aggregate_id)
        .bind(&event.event_type)
        .bind(&event.data)
        .bind(event.timestamp)
        .bind(event.version)
        .fetch_optional(&mut **tx)
        .await
    }

    async fn publish_event(&self, _event: &Event) {}
}

/// 인메모리 아이템 보관 서비스
#[derive(Default)]
struct MockItemCustody {
    locked: Mutex<HashMap<i64, String>>,
    transfers: Mutex<Vec<(i64, String)>>,
    unlocks: Mutex<Vec<i64>>,
}

#[async_trait]
impl ItemCustody for MockItemCustody {
    async fn lock(&self, item_id: i64, owner: &str) -> Result<(), CustodyError> {
        // "intruder"는 소유자가 아닌 호출자 시뮬레이션
        if owner == "intruder" {
            return Err(CustodyError::NotOwner);
        }
        self.locked
            .lock()
            .unwrap()
            .insert(item_id, owner.to_string());
        Ok(())
    }

    async fn transfer(&self, item_id: i64, to: &str) -> Result<(), CustodyError> {
        self.locked.lock().unwrap().remove(&item_id);
        self.transfers
            .lock()
            .unwrap()
            .push((item_id, to.to_string()));
        Ok(())
    }

    async fn unlock(&self, item_id: i64) -> Result<(), CustodyError> {
        self.locked.lock().unwrap().remove(&item_id);
        self.unlocks.lock().unwrap().push(item_id);
        Ok(())
    }
}

/// 인메모리 에스크로 서비스
#[derive(Default)]
struct MockFundsEscrow {
    next_id: AtomicI64,
    // escrow_id -> (from, amount)
    active: Mutex<HashMap<String, (String, i64)>>,
    refunded: Mutex<Vec<String>>,
    released: Mutex<Vec<(String, String)>>,
    fail_refunds: AtomicBool,
}

#[async_trait]
impl FundsEscrow for MockFundsEscrow {
    async fn escrow(&self, from: &str, amount: i64) -> Result<String, EscrowError> {
        // "broke"는 잔액 부족 시뮬레이션
        if from == "broke" {
            return Err(EscrowError::InsufficientFunds);
        }
        let id = format!("esc-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.active
            .lock()
            .unwrap()
            .insert(id.clone(), (from.to_string(), amount));
        Ok(id)
    }

    async fn release(&self, escrow_id: &str, to: &str) -> Result<(), EscrowError> {
        self.active.lock().unwrap().remove(escrow_id);
        self.released
            .lock()
            .unwrap()
            .push((escrow_id.to_string(), to.to_string()));
        Ok(())
    }

    async fn refund(&self, escrow_id: &str) -> Result<(), EscrowError> {
        if self.fail_refunds.load(Ordering::SeqCst) {
            return Err(EscrowError::Unavailable("에스크로 서비스 다운".to_string()));
        }
        self.active.lock().unwrap().remove(escrow_id);
        self.refunded.lock().unwrap().push(escrow_id.to_string());
        Ok(())
    }
}

fn start_cmd(item_id: i64, duration_secs: i64) -> StartAuctionCommand {
    StartAuctionCommand {
        item_id,
        seller: "seller-1".to_string(),
        min_price: 100_000,
        duration_secs,
        metadata_uri: "ipfs://mockURI".to_string(),
    }
}

fn bid_cmd(item_id: i64, bidder: &str, bid_amount: i64) -> PlaceBidCommand {
    PlaceBidCommand {
        item_id,
        bidder: bidder.to_string(),
        bid_amount,
    }
}

// endregion: --- Test Doubles

/// 경매 시작 테스트: 최소가 기록, 마감 시각 미래, 미종료 플래그
#[tokio::test]
async fn test_start_auction_records_listing() {
    let db = setup().await;
    let custody = MockItemCustody::default();

    let before = Utc::now();
    let record = handle_start_auction(start_cmd(9101, 86400), &TestEventStore, &custody, &db)
        .await
        .unwrap();

    assert_eq!(record.min_price, 100_000);
    assert!(record.end_time > before);
    assert!(!record.ended);
    assert_eq!(record.highest_bid, 0);
    assert!(record.highest_bidder.is_none());

    // 조회 결과도 커밋된 상태와 일치
    let stored = query::handlers::get_auction(&db, 9101).await.unwrap().unwrap();
    assert_eq!(stored.min_price, 100_000);
    assert!(!stored.ended);
    assert_eq!(stored.metadata_uri, "ipfs://mockURI");

    // 아이템은 경매 기간 동안 잠금 상태
    assert!(custody.locked.lock().unwrap().contains_key(&9101));
}

/// 중복 등록 테스트: 활성 레코드가 있으면 거부, 기존 레코드는 유지
#[tokio::test]
async fn test_duplicate_start_rejected() {
    let db = setup().await;
    let custody = MockItemCustody::default();

    handle_start_auction(start_cmd(9102, 86400), &TestEventStore, &custody, &db)
        .await
        .unwrap();

    let mut second = start_cmd(9102, 600);
    second.min_price = 999;
    let err = handle_start_auction(second, &TestEventStore, &custody, &db)
        .await
        .unwrap_err();
    assert_eq!(err, AuctionError::AlreadyListed);

    let stored = query::handlers::get_auction(&db, 9102).await.unwrap().unwrap();
    assert_eq!(stored.min_price, 100_000);
}

/// 등록 권한 테스트: 소유자가 아니면 거부
#[tokio::test]
async fn test_start_not_authorized() {
    let db = setup().await;
    let custody = MockItemCustody::default();

    let mut cmd = start_cmd(9103, 86400);
    cmd.seller = "intruder".to_string();
    let err = handle_start_auction(cmd, &TestEventStore, &custody, &db)
        .await
        .unwrap_err();
    assert_eq!(err, AuctionError::NotAuthorized);
    assert!(query::handlers::get_auction(&db, 9103).await.unwrap().is_none());
}

/// 파라미터 검증 테스트
#[tokio::test]
async fn test_invalid_parameters_rejected() {
    let db = setup().await;
    let custody = MockItemCustody::default();

    let mut zero_price = start_cmd(9104, 86400);
    zero_price.min_price = 0;
    assert!(matches!(
        handle_start_auction(zero_price, &TestEventStore, &custody, &db).await,
        Err(AuctionError::InvalidParameters(_))
    ));

    let zero_duration = start_cmd(9104, 0);
    assert!(matches!(
        handle_start_auction(zero_duration, &TestEventStore, &custody, &db).await,
        Err(AuctionError::InvalidParameters(_))
    ));
}

/// 입찰 테스트: 최고가는 단조 증가, 낮거나 같은 금액은 거부
#[tokio::test]
async fn test_bid_monotonic_and_rejections() {
    let db = setup().await;
    let custody = MockItemCustody::default();
    let escrow = MockFundsEscrow::default();
    let policy = AuctionPolicy::disabled();

    handle_start_auction(start_cmd(9105, 86400), &TestEventStore, &custody, &db)
        .await
        .unwrap();

    // 최소가 미만 거부
    let err = handle_place_bid(
        bid_cmd(9105, "bidder-1", 99_999),
        &TestEventStore,
        &escrow,
        &db,
        &policy,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AuctionError::BidTooLow { .. }));

    // 첫 입찰은 최소가로 가능
    let r1 = handle_place_bid(
        bid_cmd(9105, "bidder-1", 100_000),
        &TestEventStore,
        &escrow,
        &db,
        &policy,
    )
    .await
    .unwrap();
    assert_eq!(r1.highest_bid, 100_000);
    assert_eq!(r1.highest_bidder.as_deref(), Some("bidder-1"));

    // 동액 입찰 거부, 레코드 불변
    let err = handle_place_bid(
        bid_cmd(9105, "bidder-2", 100_000),
        &TestEventStore,
        &escrow,
        &db,
        &policy,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AuctionError::BidTooLow { .. }));
    let stored = query::handlers::get_auction(&db, 9105).await.unwrap().unwrap();
    assert_eq!(stored.highest_bid, 100_000);
    assert_eq!(stored.highest_bidder.as_deref(), Some("bidder-1"));

    // 초과 입찰 수락, 직전 입찰자 환불
    let r2 = handle_place_bid(
        bid_cmd(9105, "bidder-2", 150_000),
        &TestEventStore,
        &escrow,
        &db,
        &policy,
    )
    .await
    .unwrap();
    assert_eq!(r2.highest_bid, 150_000);
    assert_eq!(escrow.refunded.lock().unwrap().len(), 1);

    // 판매자 본인 입찰 거부
    let err = handle_place_bid(
        bid_cmd(9105, "seller-1", 200_000),
        &TestEventStore,
        &escrow,
        &db,
        &policy,
    )
    .await
    .unwrap_err();
    assert_eq!(err, AuctionError::SelfBid);

    // 잔액 부족 거부
    let err = handle_place_bid(
        bid_cmd(9105, "broke", 200_000),
        &TestEventStore,
        &escrow,
        &db,
        &policy,
    )
    .await
    .unwrap_err();
    assert_eq!(err, AuctionError::InsufficientFunds);
}

/// 존재하지 않는 경매 입찰 테스트
#[tokio::test]
async fn test_bid_unknown_auction() {
    let db = setup().await;
    let escrow = MockFundsEscrow::default();

    let err = handle_place_bid(
        bid_cmd(77_777, "bidder-1", 100_000),
        &TestEventStore,
        &escrow,
        &db,
        &AuctionPolicy::disabled(),
    )
    .await
    .unwrap_err();
    assert_eq!(err, AuctionError::AuctionNotFound(77_777));
}

/// 마감 이후 입찰 거부 테스트 (금액과 무관)
#[tokio::test]
async fn test_bid_after_expiry_rejected() {
    let db = setup().await;
    let custody = MockItemCustody::default();
    let escrow = MockFundsEscrow::default();

    handle_start_auction(start_cmd(9106, 1), &TestEventStore, &custody, &db)
        .await
        .unwrap();
    tokio::time::sleep(tokio::time::Duration::from_millis(1500)).await;

    let err = handle_place_bid(
        bid_cmd(9106, "bidder-1", 10_000_000),
        &TestEventStore,
        &escrow,
        &db,
        &AuctionPolicy::disabled(),
    )
    .await
    .unwrap_err();
    assert_eq!(err, AuctionError::AuctionExpired);
}

/// 환불 실패 테스트: 새 입찰은 유지되고 환불은 정합성 큐에 적재
#[tokio::test]
async fn test_refund_failure_does_not_block_new_bid() {
    let db = setup().await;
    let custody = MockItemCustody::default();
    let escrow = MockFundsEscrow::default();
    let policy = AuctionPolicy::disabled();

    handle_start_auction(start_cmd(9107, 86400), &TestEventStore, &custody, &db)
        .await
        .unwrap();
    handle_place_bid(
        bid_cmd(9107, "bidder-1", 100_000),
        &TestEventStore,
        &escrow,
        &db,
        &policy,
    )
    .await
    .unwrap();

    escrow.fail_refunds.store(true, Ordering::SeqCst);
    let r2 = handle_place_bid(
        bid_cmd(9107, "bidder-2", 150_000),
        &TestEventStore,
        &escrow,
        &db,
        &policy,
    )
    .await
    .unwrap();
    assert_eq!(r2.highest_bid, 150_000);
    assert_eq!(r2.highest_bidder.as_deref(), Some("bidder-2"));

    // 환불은 재시도 큐로
    let queued = sqlx::query(
        "SELECT count(*) as cnt FROM reconciliation_queue WHERE item_id = $1 AND kind = 'refund'",
    )
    .bind(9107_i64)
    .fetch_one(db.pool())
    .await
    .unwrap();
    assert_eq!(queued.get::<i64, _>("cnt"), 1);
}

/// 정산 테스트: 낙찰자에게 아이템, 판매자에게 자금, 두 번째 호출은 거부
#[tokio::test]
async fn test_settle_idempotent() {
    let db = setup().await;
    let custody = MockItemCustody::default();
    let escrow = MockFundsEscrow::default();
    let policy = AuctionPolicy::disabled();

    handle_start_auction(start_cmd(9108, 2), &TestEventStore, &custody, &db)
        .await
        .unwrap();
    handle_place_bid(
        bid_cmd(9108, "bidder-1", 120_000),
        &TestEventStore,
        &escrow,
        &db,
        &policy,
    )
    .await
    .unwrap();

    // 정산 전 마감 대기
    let err = handle_settle(9108, &TestEventStore, &custody, &escrow, &db)
        .await
        .unwrap_err();
    assert_eq!(err, AuctionError::AuctionNotYetEnded);
    tokio::time::sleep(tokio::time::Duration::from_millis(2500)).await;

    let result = handle_settle(9108, &TestEventStore, &custody, &escrow, &db)
        .await
        .unwrap();
    assert_eq!(result.winner.as_deref(), Some("bidder-1"));
    assert_eq!(result.winning_bid, 120_000);

    // 두 번째 정산은 거부되고 추가 이동 없음
    let err = handle_settle(9108, &TestEventStore, &custody, &escrow, &db)
        .await
        .unwrap_err();
    assert_eq!(err, AuctionError::AlreadySettled);
    assert_eq!(escrow.released.lock().unwrap().len(), 1);
    assert_eq!(custody.transfers.lock().unwrap().len(), 1);
    assert_eq!(
        custody.transfers.lock().unwrap()[0],
        (9108, "bidder-1".to_string())
    );
}

/// 유찰 정산 테스트: 아이템 반환, 자금 이동 없음
#[tokio::test]
async fn test_settle_without_bids_returns_item() {
    let db = setup().await;
    let custody = MockItemCustody::default();
    let escrow = MockFundsEscrow::default();

    handle_start_auction(start_cmd(9109, 1), &TestEventStore, &custody, &db)
        .await
        .unwrap();
    tokio::time::sleep(tokio::time::Duration::from_millis(1500)).await;

    let result = handle_settle(9109, &TestEventStore, &custody, &escrow, &db)
        .await
        .unwrap();
    assert!(result.winner.is_none());
    assert_eq!(result.winning_bid, 0);

    assert_eq!(custody.unlocks.lock().unwrap().as_slice(), &[9109]);
    assert!(custody.transfers.lock().unwrap().is_empty());
    assert!(escrow.released.lock().unwrap().is_empty());
}

/// 취소 테스트: 입찰 전에는 가능, 입찰 후에는 거부, 취소 후 재등록 가능
#[tokio::test]
async fn test_cancel_if_unstarted() {
    let db = setup().await;
    let custody = MockItemCustody::default();
    let escrow = MockFundsEscrow::default();
    let policy = AuctionPolicy::disabled();

    handle_start_auction(start_cmd(9110, 86400), &TestEventStore, &custody, &db)
        .await
        .unwrap();

    // 판매자가 아니면 거부
    let err = handle_cancel_if_unstarted(9110, "stranger", &TestEventStore, &custody, &db)
        .await
        .unwrap_err();
    assert_eq!(err, AuctionError::NotAuthorized);

    handle_cancel_if_unstarted(9110, "seller-1", &TestEventStore, &custody, &db)
        .await
        .unwrap();
    let stored = query::handlers::get_auction(&db, 9110).await.unwrap().unwrap();
    assert!(stored.ended);
    assert_eq!(custody.unlocks.lock().unwrap().as_slice(), &[9110]);

    // 종료된 레코드는 재등록으로 대체 가능
    let record = handle_start_auction(start_cmd(9110, 86400), &TestEventStore, &custody, &db)
        .await
        .unwrap();
    assert!(!record.ended);

    // 입찰이 생기면 취소 불가
    handle_place_bid(
        bid_cmd(9110, "bidder-1", 100_000),
        &TestEventStore,
        &escrow,
        &db,
        &policy,
    )
    .await
    .unwrap();
    let err = handle_cancel_if_unstarted(9110, "seller-1", &TestEventStore, &custody, &db)
        .await
        .unwrap_err();
    assert_eq!(err, AuctionError::AlreadyBid);
}

/// 스나이핑 방지 테스트: 마감 직전 입찰이 마감을 연장
#[tokio::test]
async fn test_anti_snipe_extends_end_time() {
    let db = setup().await;
    let custody = MockItemCustody::default();
    let escrow = MockFundsEscrow::default();
    let policy = AuctionPolicy {
        anti_snipe_window_secs: 60,
        anti_snipe_extension_secs: 120,
    };

    let record = handle_start_auction(start_cmd(9111, 30), &TestEventStore, &custody, &db)
        .await
        .unwrap();
    let original_end = record.end_time;

    let updated = handle_place_bid(
        bid_cmd(9111, "bidder-1", 100_000),
        &TestEventStore,
        &escrow,
        &db,
        &policy,
    )
    .await
    .unwrap();
    assert!(updated.end_time > original_end);

    let stored = query::handlers::get_auction(&db, 9111).await.unwrap().unwrap();
    assert_eq!(stored.end_time, updated.end_time);
}

/// 동시성 입찰 테스트: 어떤 인터리빙에서도 갱신 유실/이중 수락 없음
#[tokio::test]
async fn test_concurrent_bidding() {
    init_tracing();
    let db = setup().await;
    let custody = Arc::new(MockItemCustody::default());
    let escrow = Arc::new(MockFundsEscrow::default());

    handle_start_auction(start_cmd(9112, 86400), &TestEventStore, &*custody, &db)
        .await
        .unwrap();

    // 50개의 동시 입찰 생성
    let mut handles = vec![];
    for i in 1..=50_i64 {
        let db = Arc::clone(&db);
        let escrow = Arc::clone(&escrow);
        let handle = tokio::spawn(async move {
            handle_place_bid(
                bid_cmd(9112, &format!("bidder-{}", i), 100_000 + i * 1000),
                &TestEventStore,
                &*escrow,
                &db,
                &AuctionPolicy::disabled(),
            )
            .await
        });
        handles.push(handle);
    }

    let mut successful_bids = 0_i64;
    let mut failed_bids = 0_i64;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => successful_bids += 1,
            Err(AuctionError::BidTooLow { .. }) => failed_bids += 1,
            Err(e) => panic!("예상치 못한 입찰 오류: {:?}", e),
        }
    }
    info!(
        "성공한 입찰 수: {}, 실패한 입찰 수: {}",
        successful_bids, failed_bids
    );

    // 최대 금액 입찰은 어떤 직렬 순서에서도 유효하므로 반드시 수락된다
    let stored = query::handlers::get_auction(&db, 9112).await.unwrap().unwrap();
    assert_eq!(stored.highest_bid, 100_000 + 50 * 1000);
    assert_eq!(stored.highest_bidder.as_deref(), Some("bidder-50"));
    assert!(successful_bids >= 1);
    assert_eq!(successful_bids + failed_bids, 50);

    // 자금 보존: 낙찰 예치금 하나만 남고 나머지는 전부 환불
    // (추월된 입찰 환불 + 충돌 재시도에서 되돌린 예치 포함)
    assert_eq!(escrow.active.lock().unwrap().len(), 1);
    assert!(escrow.refunded.lock().unwrap().len() as i64 >= successful_bids - 1);

    // 이벤트 버전은 수락된 변경 횟수와 일치 (시작 1 + 수락된 입찰 수)
    let version = query::handlers::get_item_version(&db, 9112).await.unwrap();
    assert_eq!(version, 1 + successful_bids);
}
