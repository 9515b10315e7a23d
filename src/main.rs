// region:    --- Imports
use crate::custody::{HttpFundsEscrow, HttpItemCustody};
use crate::database::DatabaseManager;
use crate::event_store::EventConsumer;
use crate::handlers::AppState;
use crate::registry::commands::AuctionPolicy;
use crate::scheduler::ReconciliationScheduler;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use message_broker::KafkaManager;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};
// endregion: --- Imports

// region:    --- Modules
mod auction;
mod custody;
mod database;
mod event_store;
mod handlers;
mod message_broker;
mod query;
mod registry;
mod scheduler;

// endregion: --- Modules

// region:    --- Main
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // logging 초기화
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .without_time()
        .with_target(false)
        .init();

    // DatabaseManager 생성
    let db_manager = Arc::new(DatabaseManager::new().await);

    // 스키마 초기화
    if let Err(e) = db_manager.initialize_database().await {
        error!("{:<12} --> 데이터베이스 초기화 실패: {:?}", "Main", e);
        return Err(e.into());
    }
    info!("{:<12} --> 데이터베이스 초기화 성공", "Main");

    // Kafka 매니저 생성 및 토픽 준비
    let kafka_manager = Arc::new(KafkaManager::new());
    kafka_manager.create_topic("auction-events", 5, 1).await?;

    // 입찰 이력 프로젝션 시작
    let event_consumer = EventConsumer::new(db_manager.get_pool(), kafka_manager.get_consumer());
    tokio::spawn(async move {
        event_consumer.start().await;
    });

    // 외부 협력 서비스 클라이언트
    let custody = Arc::new(HttpItemCustody::from_env());
    let escrow = Arc::new(HttpFundsEscrow::from_env());

    // 실패한 자금/소유권 이동 재시도 스케줄러
    let reconciler = ReconciliationScheduler::new(
        db_manager.get_pool(),
        Arc::clone(&custody),
        Arc::clone(&escrow),
    );
    reconciler.start().await;

    // 스나이핑 방지 정책 (기본 비활성)
    let policy = AuctionPolicy::from_env();
    info!("{:<12} --> 경매 정책: {:?}", "Main", policy);

    // 테스트 페이지를 위한 cors 설정
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let state = AppState {
        db_manager,
        kafka_producer: kafka_manager.get_producer(),
        custody,
        escrow,
        policy,
    };

    // 라우터 설정
    let routes_all = Router::new()
        .route(
            "/auctions",
            post(handlers::handle_start_auction).get(handlers::handle_get_auctions),
        )
        .route("/bid", post(handlers::handle_bid))
        .route("/auctions/:id/settle", post(handlers::handle_settle_auction))
        .route("/auctions/:id/cancel", post(handlers::handle_cancel_auction))
        .route("/auctions/:id", get(handlers::handle_get_auction))
        .route(
            "/auctions/:id/highest-bid",
            get(handlers::handle_get_highest_bid),
        )
        .route("/auctions/:id/bids", get(handlers::handle_get_bid_history))
        .layer(cors)
        .layer(DefaultBodyLimit::max(1024 * 1024 * 20))
        .with_state(state);

    // 리스너 생성(로컬 호스트의 3000번 포트를 사용)
    let listener = TcpListener::bind("0.0.0.0:3000").await?;
    info!(
        "{:<12} --> Web Server: Listening on {}",
        "Main",
        listener.local_addr()?
    );

    // 서버 실행
    if let Err(err) = axum::serve(listener, routes_all.into_make_service()).await {
        error!("{:<12} --> Server error: {}", "Main", err);
    }
    Ok(())
}
// endregion: --- Main
