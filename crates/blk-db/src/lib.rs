use anyhow::{Context, Result};
use blk_schemas::{
    Block, BlockId, BlockStatus, DriverId, EligibilityFacts, LocationId, NewBlock, PenaltyRecord,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};

mod reservations;

pub use reservations::{
    claim_block, list_available_blocks, list_driver_claims, sweep_cascade_expired_claims,
    sweep_expire_stale_blocks, unclaim_block, ClaimAttempt, UnclaimAttempt,
};

pub const ENV_DB_URL: &str = "BLK_DATABASE_URL";

/// Connect to Postgres using BLK_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL)
        .with_context(|| format!("missing env var {ENV_DB_URL}"))?;
    connect(&url).await
}

pub async fn connect(url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(url)
        .await
        .context("failed to connect to Postgres")
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

/// Simple status query (connectivity + schema presence).
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;
    let ok = one == 1;

    let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema='public' and table_name='blocks'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok,
        has_blocks_table: exists,
    })
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_blocks_table: bool,
}

// ---------------------------------------------------------------------------
// Seeding (external scheduler / driver-records side)
// ---------------------------------------------------------------------------

pub async fn insert_location(pool: &PgPool, name: &str, address: &str) -> Result<LocationId> {
    let (id,): (i64,) = sqlx::query_as::<_, (i64,)>(
        r#"
        insert into locations (name, address)
        values ($1, $2)
        returning location_id
        "#,
    )
    .bind(name)
    .bind(address)
    .fetch_one(pool)
    .await
    .context("insert_location failed")?;
    Ok(LocationId(id))
}

/// Insert a block in status available.
pub async fn insert_block(pool: &PgPool, nb: &NewBlock) -> Result<Block> {
    let row = sqlx::query(
        r#"
        insert into blocks (location_id, block_date, start_time, end_time, amount_cents)
        values ($1, $2, $3, $4, $5)
        returning block_id, location_id, block_date, start_time, end_time, amount_cents, status
        "#,
    )
    .bind(nb.location_id.0)
    .bind(nb.date)
    .bind(nb.start_time)
    .bind(nb.end_time)
    .bind(nb.amount_cents)
    .fetch_one(pool)
    .await
    .context("insert_block failed")?;
    block_from_row(&row)
}

pub async fn upsert_driver_compliance(
    pool: &PgPool,
    driver_id: DriverId,
    facts: &EligibilityFacts,
) -> Result<()> {
    sqlx::query(
        r#"
        insert into driver_compliance (driver_id, license_expiry, registration_expiry, insurance_end)
        values ($1, $2, $3, $4)
        on conflict (driver_id) do update
        set license_expiry = excluded.license_expiry,
            registration_expiry = excluded.registration_expiry,
            insurance_end = excluded.insurance_end
        "#,
    )
    .bind(driver_id.0)
    .bind(facts.license_expiry)
    .bind(facts.registration_expiry)
    .bind(facts.insurance_end)
    .execute(pool)
    .await
    .context("upsert_driver_compliance failed")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

pub async fn fetch_block(pool: &PgPool, block_id: BlockId) -> Result<Option<Block>> {
    let row = sqlx::query(
        r#"
        select block_id, location_id, block_date, start_time, end_time, amount_cents, status
        from blocks
        where block_id = $1
        "#,
    )
    .bind(block_id.0)
    .fetch_optional(pool)
    .await
    .context("fetch_block failed")?;
    row.as_ref().map(block_from_row).transpose()
}

pub async fn fetch_driver_compliance(
    pool: &PgPool,
    driver_id: DriverId,
) -> Result<Option<EligibilityFacts>> {
    let row = sqlx::query(
        r#"
        select license_expiry, registration_expiry, insurance_end
        from driver_compliance
        where driver_id = $1
        "#,
    )
    .bind(driver_id.0)
    .fetch_optional(pool)
    .await
    .context("fetch_driver_compliance failed")?;

    match row {
        Some(r) => Ok(Some(EligibilityFacts {
            license_expiry: r.try_get("license_expiry")?,
            registration_expiry: r.try_get("registration_expiry")?,
            insurance_end: r.try_get("insurance_end")?,
        })),
        None => Ok(None),
    }
}

pub async fn fetch_penalties(pool: &PgPool, driver_id: DriverId) -> Result<Vec<PenaltyRecord>> {
    let rows = sqlx::query(
        r#"
        select penalty_id, driver_id, block_id, claim_id, points, reason, created_at
        from penalty_events
        where driver_id = $1
        order by penalty_id asc
        "#,
    )
    .bind(driver_id.0)
    .fetch_all(pool)
    .await
    .context("fetch_penalties failed")?;
    rows.iter().map(penalty_from_row).collect()
}

/// Number of claim rows for a block in any status.
pub async fn count_claims_for_block(pool: &PgPool, block_id: BlockId) -> Result<i64> {
    let (n,): (i64,) = sqlx::query_as::<_, (i64,)>(
        "select count(*)::bigint from claims where block_id = $1",
    )
    .bind(block_id.0)
    .fetch_one(pool)
    .await
    .context("count_claims_for_block failed")?;
    Ok(n)
}

// ---------------------------------------------------------------------------
// Row mapping + error classification
// ---------------------------------------------------------------------------

pub(crate) fn block_from_row(row: &PgRow) -> Result<Block> {
    Ok(Block {
        block_id: BlockId(row.try_get("block_id")?),
        location_id: LocationId(row.try_get("location_id")?),
        date: row.try_get("block_date")?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        amount_cents: row.try_get("amount_cents")?,
        status: BlockStatus::parse(&row.try_get::<String, _>("status")?)?,
    })
}

pub(crate) fn penalty_from_row(row: &PgRow) -> Result<PenaltyRecord> {
    Ok(PenaltyRecord {
        penalty_id: row.try_get("penalty_id")?,
        driver_id: DriverId(row.try_get("driver_id")?),
        block_id: BlockId(row.try_get("block_id")?),
        claim_id: blk_schemas::ClaimId(row.try_get("claim_id")?),
        points: row.try_get("points")?,
        reason: row.try_get("reason")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Detect a Postgres unique constraint violation by name.
pub(crate) fn is_unique_constraint_violation(err: &sqlx::Error, constraint: &str) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.code().as_deref() == Some("23505") && db_err.constraint() == Some(constraint)
        }
        _ => false,
    }
}

/// True when the failure is a serialization conflict (40001) or deadlock
/// (40P01). Both compound operations are all-or-nothing, so the whole
/// transaction can simply be run again.
pub fn is_retryable(err: &anyhow::Error) -> bool {
    match err.downcast_ref::<sqlx::Error>() {
        Some(sqlx::Error::Database(db_err)) => {
            matches!(db_err.code().as_deref(), Some("40001") | Some("40P01"))
        }
        _ => false,
    }
}
