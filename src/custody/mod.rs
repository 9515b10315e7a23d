/// 외부 협력 서비스 연동
/// 1. 아이템 보관(소유권) 서비스: lock / transfer / unlock
/// 2. 자금 에스크로 서비스: escrow / release / refund
/// 상태 커밋 이후 실패한 자금/소유권 이동은 정합성 큐에 적재되어 재시도된다.
// region:    --- Imports
use async_trait::async_trait;
use serde::Deserialize;
use sqlx::PgPool;
use thiserror::Error;
use tracing::{info, warn};

// endregion: --- Imports

// region:    --- Errors

/// 보관 서비스 오류
#[derive(Debug, Clone, Error)]
pub enum CustodyError {
    #[error("아이템 소유자가 아닙니다.")]
    NotOwner,
    #[error("보관 서비스가 요청을 거부했습니다: {0}")]
    Rejected(String),
    #[error("보관 서비스에 연결할 수 없습니다: {0}")]
    Unavailable(String),
}

/// 에스크로 서비스 오류
#[derive(Debug, Clone, Error)]
pub enum EscrowError {
    #[error("입찰자의 잔액이 부족합니다.")]
    InsufficientFunds,
    #[error("에스크로 서비스가 요청을 거부했습니다: {0}")]
    Rejected(String),
    #[error("에스크로 서비스에 연결할 수 없습니다: {0}")]
    Unavailable(String),
}

// endregion: --- Errors

// region:    --- Traits

/// 아이템 보관 서비스 트레이트
#[async_trait]
pub trait ItemCustody: Send + Sync {
    /// 경매 기간 동안 아이템을 잠금 (소유자 검증 포함)
    async fn lock(&self, item_id: i64, owner: &str) -> Result<(), CustodyError>;
    /// 낙찰자에게 아이템 이전
    async fn transfer(&self, item_id: i64, to: &str) -> Result<(), CustodyError>;
    /// 잠금 해제 (판매자에게 반환)
    async fn unlock(&self, item_id: i64) -> Result<(), CustodyError>;
}

/// 자금 에스크로 서비스 트레이트
#[async_trait]
pub trait FundsEscrow: Send + Sync {
    /// 입찰자 자금 예치, 에스크로 ID 반환
    async fn escrow(&self, from: &str, amount: i64) -> Result<String, EscrowError>;
    /// 예치 자금을 수령인에게 지급
    async fn release(&self, escrow_id: &str, to: &str) -> Result<(), EscrowError>;
    /// 예치 자금 환불
    async fn refund(&self, escrow_id: &str) -> Result<(), EscrowError>;
}

// endregion: --- Traits

// region:    --- HTTP Clients

/// 보관 서비스 HTTP 클라이언트
pub struct HttpItemCustody {
    client: reqwest::Client,
    base_url: String,
}

impl HttpItemCustody {
    pub fn new(base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }

    /// OWNERSHIP_SERVICE_URL 환경변수로 생성
    pub fn from_env() -> Self {
        let base_url =
            std::env::var("OWNERSHIP_SERVICE_URL").expect("OWNERSHIP_SERVICE_URL must be set");
        Self::new(base_url)
    }

    async fn post(
        &self,
        path: String,
        body: serde_json::Value,
    ) -> Result<reqwest::Response, CustodyError> {
        self.client
            .post(format!("{}{}", self.base_url, path))
            .json(&body)
            .send()
            .await
            .map_err(|e| CustodyError::Unavailable(e.to_string()))
    }
}

#[async_trait]
impl ItemCustody for HttpItemCustody {
    async fn lock(&self, item_id: i64, owner: &str) -> Result<(), CustodyError> {
        info!("{:<12} --> 아이템 잠금 요청: item={}", "Custody", item_id);
        let res = self
            .post(
                format!("/items/{}/lock", item_id),
                serde_json::json!({ "owner": owner }),
            )
            .await?;
        match res.status() {
            s if s.is_success() => Ok(()),
            reqwest::StatusCode::FORBIDDEN => Err(CustodyError::NotOwner),
            s => Err(CustodyError::Rejected(format!("lock 실패: {}", s))),
        }
    }

    async fn transfer(&self, item_id: i64, to: &str) -> Result<(), CustodyError> {
        info!(
            "{:<12} --> 아이템 이전 요청: item={}, to={}",
            "Custody", item_id, to
        );
        let res = self
            .post(
                format!("/items/{}/transfer", item_id),
                serde_json::json!({ "to": to }),
            )
            .await?;
        if res.status().is_success() {
            Ok(())
        } else {
            Err(CustodyError::Rejected(format!(
                "transfer 실패: {}",
                res.status()
            )))
        }
    }

    async fn unlock(&self, item_id: i64) -> Result<(), CustodyError> {
        info!("{:<12} --> 아이템 잠금 해제: item={}", "Custody", item_id);
        let res = self
            .post(format!("/items/{}/unlock", item_id), serde_json::json!({}))
            .await?;
        if res.status().is_success() {
            Ok(())
        } else {
            Err(CustodyError::Rejected(format!(
                "unlock 실패: {}",
                res.status()
            )))
        }
    }
}

/// 에스크로 서비스 HTTP 클라이언트
pub struct HttpFundsEscrow {
    client: reqwest::Client,
    base_url: String,
}

/// escrow 응답 바디
#[derive(Deserialize)]
struct EscrowCreated {
    escrow_id: String,
}

impl HttpFundsEscrow {
    pub fn new(base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }

    /// ESCROW_SERVICE_URL 환경변수로 생성
    pub fn from_env() -> Self {
        let base_url =
            std::env::var("ESCROW_SERVICE_URL").expect("ESCROW_SERVICE_URL must be set");
        Self::new(base_url)
    }

    async fn post(
        &self,
        path: String,
        body: serde_json::Value,
    ) -> Result<reqwest::Response, EscrowError> {
        self.client
            .post(format!("{}{}", self.base_url, path))
            .json(&body)
            .send()
            .await
            .map_err(|e| EscrowError::Unavailable(e.to_string()))
    }
}

#[async_trait]
impl FundsEscrow for HttpFundsEscrow {
    async fn escrow(&self, from: &str, amount: i64) -> Result<String, EscrowError> {
        info!(
            "{:<12} --> 자금 예치 요청: from={}, amount={}",
            "Escrow", from, amount
        );
        let res = self
            .post(
                "/escrows".to_string(),
                serde_json::json!({ "from": from, "amount": amount }),
            )
            .await?;
        match res.status() {
            s if s.is_success() => {
                let created: EscrowCreated = res
                    .json()
                    .await
                    .map_err(|e| EscrowError::Rejected(e.to_string()))?;
                Ok(created.escrow_id)
            }
            reqwest::StatusCode::PAYMENT_REQUIRED => Err(EscrowError::InsufficientFunds),
            s => Err(EscrowError::Rejected(format!("escrow 실패: {}", s))),
        }
    }

    async fn release(&self, escrow_id: &str, to: &str) -> Result<(), EscrowError> {
        info!(
            "{:<12} --> 예치 자금 지급: escrow={}, to={}",
            "Escrow", escrow_id, to
        );
        let res = self
            .post(
                format!("/escrows/{}/release", escrow_id),
                serde_json::json!({ "to": to }),
            )
            .await?;
        if res.status().is_success() {
            Ok(())
        } else {
            Err(EscrowError::Rejected(format!(
                "release 실패: {}",
                res.status()
            )))
        }
    }

    async fn refund(&self, escrow_id: &str) -> Result<(), EscrowError> {
        info!("{:<12} --> 예치 자금 환불: escrow={}", "Escrow", escrow_id);
        let res = self
            .post(
                format!("/escrows/{}/refund", escrow_id),
                serde_json::json!({}),
            )
            .await?;
        if res.status().is_success() {
            Ok(())
        } else {
            Err(EscrowError::Rejected(format!(
                "refund 실패: {}",
                res.status()
            )))
        }
    }
}

// endregion: --- HTTP Clients

// region:    --- Reconciliation Queue

/// 재시도 대기 중인 자금/소유권 이동
/// kind: refund | release | transfer | unlock
#[derive(Debug, sqlx::FromRow)]
pub struct QueuedMovement {
    pub id: i64,
    pub item_id: i64,
    pub kind: String,
    pub escrow_id: Option<String>,
    pub target: Option<String>,
    pub attempts: i32,
}

/// 실패한 이동을 정합성 큐에 적재 (적재 실패는 경고만 남긴다)
pub async fn enqueue_movement(
    pool: &PgPool,
    item_id: i64,
    kind: &str,
    escrow_id: Option<&str>,
    target: Option<&str>,
) {
    let result = sqlx::query(
        "INSERT INTO reconciliation_queue (item_id, kind, escrow_id, target, attempts, queued_at)
         VALUES ($1, $2, $3, $4, 0, now())",
    )
    .bind(item_id)
    .bind(kind)
    .bind(escrow_id)
    .bind(target)
    .execute(pool)
    .await;

    match result {
        Ok(_) => warn!(
            "{:<12} --> 이동 실패, 정합성 큐 적재: item={}, kind={}",
            "Custody", item_id, kind
        ),
        Err(e) => warn!(
            "{:<12} --> 정합성 큐 적재 실패 (수동 복구 필요): item={}, kind={}, err={:?}",
            "Custody", item_id, kind, e
        ),
    }
}

// endregion: --- Reconciliation Queue
