// region:    --- Imports
use crate::auction::events::AuctionEvent;
use crate::message_broker::{KafkaConsumer, KafkaProducer};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

// endregion: --- Imports

// region:    --- Event Model
/// 이벤트 저장소에 저장되는 이벤트 모델
#[derive(Debug, Serialize, Deserialize, FromRow, Clone)]
pub struct Event {
    pub id: i64,
    pub aggregate_id: i64,
    pub event_type: String,
    pub data: serde_json::Value,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub version: i64,
}

impl Event {
    /// 도메인 이벤트로부터 저장용 이벤트 생성
    pub fn from_auction_event(
        item_id: i64,
        version: i64,
        auction_event: &AuctionEvent,
    ) -> Result<Self, serde_json::Error> {
        Ok(Event {
            id: 0,
            aggregate_id: item_id,
            event_type: auction_event.event_type().to_string(),
            data: serde_json::to_value(auction_event)?,
            timestamp: chrono::Utc::now(),
            version,
        })
    }
}
// endregion: --- Event Model

// region:    --- Event Store Trait
/// 이벤트 저장소 트레이트
/// append는 호출자의 트랜잭션 안에서 실행되어 레코드 변경과 함께 커밋된다.
/// (aggregate_id, version) 유니크 제약 충돌 시 None을 반환한다.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append_event(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &Event,
    ) -> Result<Option<i64>, sqlx::Error>;

    /// 커밋된 이벤트를 브로커에 발행 (실패해도 상태를 되돌리지 않는다)
    async fn publish_event(&self, event: &Event);
}

/// 이벤트 저장소 구현체
pub struct PostgresEventStore {
    kafka_producer: Arc<KafkaProducer>,
}

impl PostgresEventStore {
    pub fn new(kafka_producer: Arc<KafkaProducer>) -> Self {
        Self { kafka_producer }
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
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

    async fn publish_event(&self, event: &Event) {
        let payload = match serde_json::to_string(event) {
            Ok(p) => p,
            Err(e) => {
                error!("{:<12} --> 이벤트 직렬화 실패: {:?}", "EventStore", e);
                return;
            }
        };
        if let Err(e) = self
            .kafka_producer
            .send_message("auction-events", &event.aggregate_id.to_string(), &payload)
            .await
        {
            // 발행 실패는 로그만 남긴다, 레코드는 이미 커밋됨
            warn!("{:<12} --> 이벤트 발행 실패: {}", "EventStore", e);
        }
    }
}

// endregion: --- Event Store

// region:    --- Event Consumer
/// 입찰 이력 프로젝션 컨슈머
/// BidPlaced 이벤트를 소비하여 bids 테이블을 유지한다 (조회 전용)
pub struct EventConsumer {
    pool: Arc<PgPool>,
    kafka_consumer: Arc<KafkaConsumer>,
}

impl EventConsumer {
    pub fn new(pool: Arc<PgPool>, kafka_consumer: Arc<KafkaConsumer>) -> Self {
        EventConsumer {
            pool,
            kafka_consumer,
        }
    }

    /// 이벤트 소비 시작
    pub async fn start(&self) {
        let pool = Arc::clone(&self.pool);
        if let Err(e) = self
            .kafka_consumer
            .consume_events("auction-events", move |event| {
                let pool = Arc::clone(&pool);
                Box::pin(async move {
                    if let Err(e) = Self::process_event(&pool, event).await {
                        error!("{:<12} --> 이벤트 처리 오류: {:?}", "EventConsume", e);
                    }
                    Ok(())
                })
            })
            .await
        {
            error!("{:<12} --> 이벤트 소비 오류: {:?}", "EventConsume", e);
        }
    }

    /// 이벤트 처리
    async fn process_event(pool: &PgPool, event: Event) -> Result<(), sqlx::Error> {
        match event.event_type.as_str() {
            "BidPlaced" => Self::project_bid(pool, &event).await?,
            // 나머지 이벤트는 레코드에 이미 반영되어 있음
            other => debug!("{:<12} --> 프로젝션 대상 아님: {}", "EventConsume", other),
        }
        Ok(())
    }

    /// 입찰 이력 적재
    async fn project_bid(pool: &PgPool, event: &Event) -> Result<(), sqlx::Error> {
        let auction_event: AuctionEvent = serde_json::from_value(event.data.clone())
            .map_err(|e| sqlx::Error::Protocol(e.to_string()))?;
        if let AuctionEvent::BidPlaced {
            item_id,
            bidder,
            bid_amount,
            escrow_id,
            timestamp,
            ..
        } = auction_event
        {
            sqlx::query(
                "INSERT INTO bids (item_id, bidder, bid_amount, escrow_id, bid_time)
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(item_id)
            .bind(&bidder)
            .bind(bid_amount)
            .bind(&escrow_id)
            .bind(timestamp)
            .execute(pool)
            .await?;
            info!(
                "{:<12} --> 입찰 이력 적재: item={}, amount={}",
                "EventConsume", item_id, bid_amount
            );
        }
        Ok(())
    }
}
// endregion: --- Event Consumer
