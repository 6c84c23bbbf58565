//! The two compound reservation transactions, the sweep steps, and the
//! driver-facing listings.
//!
//! Each compound operation runs in one SERIALIZABLE transaction and takes a
//! row lock on the block first. Returning early drops the transaction, which
//! rolls it back; only the success paths call `commit`. Serialization
//! failures surface as errors that [`crate::is_retryable`] recognizes.

use anyhow::{Context, Result};
use blk_schemas::schedule::overlap_limit_exceeded;
use blk_schemas::{
    Block, BlockDetail, BlockId, BlockStatus, BlockWindow, Claim, ClaimId, ClaimStatus,
    ClaimedBlock, DriverId, Location, LocationId, ReservationPolicy, UnclaimOutcome,
    LATE_UNCLAIM_REASON,
};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction};

use crate::{block_from_row, is_unique_constraint_violation, penalty_from_row};

const ACTIVE_CLAIM_INDEX: &str = "uq_active_claim_per_block";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimAttempt {
    Claimed(Claim),
    BlockNotFound,
    OverlapLimitExceeded,
    AlreadyClaimed,
    NotAvailable(BlockStatus),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnclaimAttempt {
    Done(UnclaimOutcome),
    BlockNotFound,
    ClaimNotFound,
}

async fn begin_serializable(pool: &PgPool) -> Result<Transaction<'static, Postgres>> {
    let mut tx = pool.begin().await.context("begin transaction failed")?;
    sqlx::query("set transaction isolation level serializable")
        .execute(&mut *tx)
        .await
        .context("set isolation level failed")?;
    Ok(tx)
}

async fn lock_block(conn: &mut PgConnection, block_id: BlockId) -> Result<Option<Block>> {
    let row = sqlx::query(
        r#"
        select block_id, location_id, block_date, start_time, end_time, amount_cents, status
        from blocks
        where block_id = $1
        for update
        "#,
    )
    .bind(block_id.0)
    .fetch_optional(conn)
    .await
    .context("lock block failed")?;
    row.as_ref().map(block_from_row).transpose()
}

/// ClaimBlock. Check order: block exists, overlap budget, no active claim,
/// block still available and not started. Only then insert + flip the
/// block, together.
pub async fn claim_block(
    pool: &PgPool,
    block_id: BlockId,
    driver_id: DriverId,
    policy: &ReservationPolicy,
    now: DateTime<Utc>,
) -> Result<ClaimAttempt> {
    let mut tx = begin_serializable(pool).await?;

    let Some(block) = lock_block(&mut tx, block_id).await? else {
        return Ok(ClaimAttempt::BlockNotFound);
    };

    // The driver's accepted claims on the same civil day, excluding this
    // block so a retried claim reports AlreadyClaimed rather than an overlap.
    let rows = sqlx::query(
        r#"
        select b.block_date, b.start_time, b.end_time
        from claims c
        join blocks b on b.block_id = c.block_id
        where c.driver_id = $1
          and c.status = 'accepted'
          and b.block_date = $2
          and c.block_id <> $3
        "#,
    )
    .bind(driver_id.0)
    .bind(block.date)
    .bind(block_id.0)
    .fetch_all(&mut *tx)
    .await
    .context("claim_block same-day claims query failed")?;

    let mut same_day = Vec::with_capacity(rows.len());
    for r in &rows {
        same_day.push(BlockWindow::resolve(
            r.try_get("block_date")?,
            r.try_get("start_time")?,
            r.try_get("end_time")?,
            policy.timezone,
        ));
    }
    if overlap_limit_exceeded(&block.window(policy), &same_day) {
        return Ok(ClaimAttempt::OverlapLimitExceeded);
    }

    let (active,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1 from claims where block_id = $1 and status <> 'expired'
        )
        "#,
    )
    .bind(block_id.0)
    .fetch_one(&mut *tx)
    .await
    .context("claim_block active-claim query failed")?;
    if active {
        return Ok(ClaimAttempt::AlreadyClaimed);
    }

    if block.status != BlockStatus::Available {
        return Ok(ClaimAttempt::NotAvailable(block.status));
    }
    // Started but not yet swept.
    if block.window(policy).starts_at <= now {
        return Ok(ClaimAttempt::NotAvailable(BlockStatus::Expired));
    }

    let inserted = sqlx::query(
        r#"
        insert into claims (block_id, driver_id, claim_time, status)
        values ($1, $2, $3, 'accepted')
        returning claim_id, block_id, driver_id, claim_time, status
        "#,
    )
    .bind(block_id.0)
    .bind(driver_id.0)
    .bind(now)
    .fetch_one(&mut *tx)
    .await;

    let row = match inserted {
        Ok(r) => r,
        Err(e) if is_unique_constraint_violation(&e, ACTIVE_CLAIM_INDEX) => {
            return Ok(ClaimAttempt::AlreadyClaimed);
        }
        Err(e) => return Err(anyhow::Error::new(e).context("claim_block insert failed")),
    };
    let claim = claim_from_row(&row)?;

    sqlx::query("update blocks set status = 'accepted' where block_id = $1")
        .bind(block_id.0)
        .execute(&mut *tx)
        .await
        .context("claim_block block update failed")?;

    tx.commit().await.context("claim_block commit failed")?;
    Ok(ClaimAttempt::Claimed(claim))
}

/// UnclaimBlock. A late unclaim without override writes nothing and asks for
/// confirmation; with override it also appends the penalty row.
pub async fn unclaim_block(
    pool: &PgPool,
    block_id: BlockId,
    driver_id: DriverId,
    override_penalty: bool,
    policy: &ReservationPolicy,
    now: DateTime<Utc>,
) -> Result<UnclaimAttempt> {
    let mut tx = begin_serializable(pool).await?;

    let Some(block) = lock_block(&mut tx, block_id).await? else {
        return Ok(UnclaimAttempt::BlockNotFound);
    };

    let row = sqlx::query(
        r#"
        select claim_id, block_id, driver_id, claim_time, status
        from claims
        where block_id = $1 and driver_id = $2 and status = 'accepted'
        for update
        "#,
    )
    .bind(block_id.0)
    .bind(driver_id.0)
    .fetch_optional(&mut *tx)
    .await
    .context("unclaim_block claim query failed")?;
    let Some(row) = row else {
        return Ok(UnclaimAttempt::ClaimNotFound);
    };
    let claim = claim_from_row(&row)?;

    let starts_at = block.window(policy).starts_at;
    let minutes_until_start = policy.minutes_until(starts_at, now);
    let late = policy.within_penalty_window(starts_at, now);
    if late && !override_penalty {
        return Ok(UnclaimAttempt::Done(UnclaimOutcome::ConfirmationRequired {
            minutes_until_start,
            points: policy.late_unclaim_points,
        }));
    }

    sqlx::query("delete from claims where claim_id = $1")
        .bind(claim.claim_id.0)
        .execute(&mut *tx)
        .await
        .context("unclaim_block delete failed")?;

    sqlx::query("update blocks set status = 'available' where block_id = $1")
        .bind(block_id.0)
        .execute(&mut *tx)
        .await
        .context("unclaim_block block reset failed")?;

    let penalty = if late {
        let row = sqlx::query(
            r#"
            insert into penalty_events (driver_id, block_id, claim_id, points, reason, created_at)
            values ($1, $2, $3, $4, $5, $6)
            returning penalty_id, driver_id, block_id, claim_id, points, reason, created_at
            "#,
        )
        .bind(driver_id.0)
        .bind(block_id.0)
        .bind(claim.claim_id.0)
        .bind(policy.late_unclaim_points)
        .bind(LATE_UNCLAIM_REASON)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .context("unclaim_block penalty insert failed")?;
        Some(penalty_from_row(&row)?)
    } else {
        None
    };

    tx.commit().await.context("unclaim_block commit failed")?;
    Ok(UnclaimAttempt::Done(UnclaimOutcome::Released { claim, penalty }))
}

/// Sweep step 1: available blocks whose start has passed and that have never
/// been claimed become expired. Returns the ids that changed.
pub async fn sweep_expire_stale_blocks(
    pool: &PgPool,
    policy: &ReservationPolicy,
    now: DateTime<Utc>,
) -> Result<Vec<BlockId>> {
    let ids: Vec<(i64,)> = sqlx::query_as::<_, (i64,)>(
        r#"
        update blocks b
        set status = 'expired'
        where b.status = 'available'
          and ((b.block_date + b.start_time) at time zone $1) < $2
          and not exists (select 1 from claims c where c.block_id = b.block_id)
        returning b.block_id
        "#,
    )
    .bind(policy.timezone.name())
    .bind(now)
    .fetch_all(pool)
    .await
    .context("sweep_expire_stale_blocks failed")?;

    let mut out: Vec<BlockId> = ids.into_iter().map(|(id,)| BlockId(id)).collect();
    out.sort();
    tracing::debug!(expired = out.len(), "sweep: stale blocks expired");
    Ok(out)
}

/// Sweep step 2: claims on expired blocks follow their block. Already
/// expired claims are not touched, so re-running is a no-op.
pub async fn sweep_cascade_expired_claims(pool: &PgPool) -> Result<u64> {
    let res = sqlx::query(
        r#"
        update claims c
        set status = 'expired'
        from blocks b
        where b.block_id = c.block_id
          and b.status = 'expired'
          and c.status <> 'expired'
        "#,
    )
    .execute(pool)
    .await
    .context("sweep_cascade_expired_claims failed")?;
    tracing::debug!(expired = res.rows_affected(), "sweep: claims cascaded");
    Ok(res.rows_affected())
}

const DETAIL_COLUMNS: &str = r#"
    b.block_id, b.location_id, b.block_date, b.start_time, b.end_time,
    b.amount_cents, b.status,
    l.name as location_name, l.address as location_address
"#;

/// Claimable blocks: available, no active claim, start still in the future.
/// Driver eligibility is filtered by the caller.
pub async fn list_available_blocks(
    pool: &PgPool,
    policy: &ReservationPolicy,
    now: DateTime<Utc>,
) -> Result<Vec<BlockDetail>> {
    let sql = format!(
        r#"
        select {DETAIL_COLUMNS}
        from blocks b
        join locations l on l.location_id = b.location_id
        where b.status = 'available'
          and not exists (
              select 1 from claims c where c.block_id = b.block_id and c.status <> 'expired'
          )
          and ((b.block_date + b.start_time) at time zone $1) > $2
        order by b.block_date, b.start_time, b.block_id
        "#
    );
    let rows = sqlx::query(&sql)
        .bind(policy.timezone.name())
        .bind(now)
        .fetch_all(pool)
        .await
        .context("list_available_blocks failed")?;
    rows.iter().map(|r| detail_from_row(r, policy)).collect()
}

/// The driver's latest claim per block (any status), with details.
pub async fn list_driver_claims(
    pool: &PgPool,
    driver_id: DriverId,
    policy: &ReservationPolicy,
) -> Result<Vec<ClaimedBlock>> {
    let sql = format!(
        r#"
        select distinct on (c.block_id)
          c.claim_id, c.driver_id, c.claim_time, c.status as claim_status,
          {DETAIL_COLUMNS}
        from claims c
        join blocks b on b.block_id = c.block_id
        join locations l on l.location_id = b.location_id
        where c.driver_id = $1
        order by c.block_id, c.claim_time desc, c.claim_id desc
        "#
    );
    let rows = sqlx::query(&sql)
        .bind(driver_id.0)
        .fetch_all(pool)
        .await
        .context("list_driver_claims failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for r in &rows {
        let detail = detail_from_row(r, policy)?;
        let claim = Claim {
            claim_id: ClaimId(r.try_get("claim_id")?),
            block_id: detail.block.block_id,
            driver_id: DriverId(r.try_get("driver_id")?),
            claim_time: r.try_get("claim_time")?,
            status: ClaimStatus::parse(&r.try_get::<String, _>("claim_status")?)?,
        };
        out.push(ClaimedBlock { claim, detail });
    }
    Ok(out)
}

fn claim_from_row(row: &PgRow) -> Result<Claim> {
    Ok(Claim {
        claim_id: ClaimId(row.try_get("claim_id")?),
        block_id: BlockId(row.try_get("block_id")?),
        driver_id: DriverId(row.try_get("driver_id")?),
        claim_time: row.try_get("claim_time")?,
        status: ClaimStatus::parse(&row.try_get::<String, _>("status")?)?,
    })
}

fn detail_from_row(row: &PgRow, policy: &ReservationPolicy) -> Result<BlockDetail> {
    let block = block_from_row(row)?;
    let window = block.window(policy);
    Ok(BlockDetail {
        location: Location {
            location_id: LocationId(row.try_get("location_id")?),
            name: row.try_get("location_name")?,
            address: row.try_get("location_address")?,
        },
        starts_at: window.starts_at,
        ends_at: window.ends_at,
        block,
    })
}
