/// 정합성 큐 재시도 스케줄러
/// 상태 커밋 이후 실패한 자금/소유권 이동(refund/release/transfer/unlock)을
/// 주기적으로 재시도한다. 이동이 끝날 때까지 큐에 남고, 성공 시 제거된다.
// region:    --- Imports
use crate::custody::{FundsEscrow, ItemCustody, QueuedMovement};
use sqlx::PgPool;
use std::sync::Arc;
use tokio::time::{interval, Duration};
use tracing::{debug, error, warn};

// endregion: --- Imports

// region:    --- Reconciliation Scheduler

// 한 주기에 처리하는 최대 큐 항목 수
const BATCH_SIZE: i64 = 20;

pub struct ReconciliationScheduler<C, E> {
    pool: Arc<PgPool>,
    custody: Arc<C>,
    escrow: Arc<E>,
}

impl<C, E> ReconciliationScheduler<C, E>
where
    C: ItemCustody + 'static,
    E: FundsEscrow + 'static,
{
    pub fn new(pool: Arc<PgPool>, custody: Arc<C>, escrow: Arc<E>) -> Self {
        Self {
            pool,
            custody,
            escrow,
        }
    }

    /// 재시도 루프 시작
    pub async fn start(&self) {
        let pool = Arc::clone(&self.pool);
        let custody = Arc::clone(&self.custody);
        let escrow = Arc::clone(&self.escrow);
        tokio::spawn(async move {
            let mut interval = interval(Duration::from_secs(5));
            loop {
                interval.tick().await;
                if let Err(e) = Self::process_queue(&pool, &*custody, &*escrow).await {
                    error!(
                        "{:<12} --> 정합성 큐 처리 중 오류 발생: {:?}",
                        "Reconcile", e
                    );
                }
            }
        });
    }

    /// 대기 중인 이동 재시도
    async fn process_queue(
        pool: &PgPool,
        custody: &C,
        escrow: &E,
    ) -> Result<(), sqlx::Error> {
        let pending = sqlx::query_as::<_, QueuedMovement>(
            "SELECT id, item_id, kind, escrow_id, target, attempts
             FROM reconciliation_queue
             ORDER BY queued_at
             LIMIT $1",
        )
        .bind(BATCH_SIZE)
        .fetch_all(pool)
        .await?;

        for movement in pending {
            match Self::dispatch(custody, escrow, &movement).await {
                Ok(_) => {
                    sqlx::query("DELETE FROM reconciliation_queue WHERE id = $1")
                        .bind(movement.id)
                        .execute(pool)
                        .await?;
                    debug!(
                        "{:<12} --> 이동 재시도 성공: item={}, kind={}",
                        "Reconcile", movement.item_id, movement.kind
                    );
                }
                Err(e) => {
                    sqlx::query(
                        "UPDATE reconciliation_queue SET attempts = attempts + 1 WHERE id = $1",
                    )
                    .bind(movement.id)
                    .execute(pool)
                    .await?;
                    warn!(
                        "{:<12} --> 이동 재시도 실패 (attempts={}): item={}, kind={}, err={}",
                        "Reconcile",
                        movement.attempts + 1,
                        movement.item_id,
                        movement.kind,
                        e
                    );
                }
            }
        }

        Ok(())
    }

    /// kind별 이동 실행
    async fn dispatch(
        custody: &C,
        escrow: &E,
        movement: &QueuedMovement,
    ) -> Result<(), String> {
        match movement.kind.as_str() {
            "refund" => {
                let escrow_id = movement
                    .escrow_id
                    .as_deref()
                    .ok_or_else(|| "escrow_id 누락".to_string())?;
                escrow.refund(escrow_id).await.map_err(|e| e.to_string())
            }
            "release" => {
                let escrow_id = movement
                    .escrow_id
                    .as_deref()
                    .ok_or_else(|| "escrow_id 누락".to_string())?;
                let target = movement
                    .target
                    .as_deref()
                    .ok_or_else(|| "target 누락".to_string())?;
                escrow
                    .release(escrow_id, target)
                    .await
                    .map_err(|e| e.to_string())
            }
            "transfer" => {
                let target = movement
                    .target
                    .as_deref()
                    .ok_or_else(|| "target 누락".to_string())?;
                custody
                    .transfer(movement.item_id, target)
                    .await
                    .map_err(|e| e.to_string())
            }
            "unlock" => custody
                .unlock(movement.item_id)
                .await
                .map_err(|e| e.to_string()),
            other => Err(format!("알 수 없는 이동 종류: {}", other)),
        }
    }
}

// endregion: --- Reconciliation Scheduler
