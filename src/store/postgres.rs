//! PostgreSQL backend (`sql/schema.sql`).
//!
//! Usage counters are checked and incremented by a single conditional `UPDATE`, so concurrent
//! logins serialize on the row lock and re-evaluate the limit after the winner commits.
//! Config merges run under `SELECT ... FOR UPDATE` inside a transaction.

use std::time::Duration;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use sqlx::{
    PgPool, Postgres, Row, Transaction,
    postgres::{PgPoolOptions, PgRow},
    types::Json,
};
use time::OffsetDateTime;
use tracing::{Instrument, Span, info_span};
use uuid::Uuid;

use super::{ConfigUpdate, IdentityDirectory, IdentityRecord, OrgPolicy, Store, UseOutcome};
use crate::identity::{
    actor::Actor,
    client_secret::ClientSecret,
    config::UniversalAuthConfig,
    error::AuthError,
    gcp::{GcpAuthConfig, GcpAuthType},
    policy::TokenPolicy,
    token::AccessTokenRecord,
    trusted_ip::{TrustedIp, TrustedIpList},
    verifier::AuthMethod,
};

const UA_COLUMNS: &str = "id, identity_id, client_id, access_token_ttl, access_token_max_ttl, \
    access_token_num_uses_limit, access_token_period, client_secret_trusted_ips, \
    access_token_trusted_ips, created_at, updated_at";

const SECRET_COLUMNS: &str = "id, identity_ua_id, identity_id, description, client_secret_prefix, \
    client_secret_hash, client_secret_num_uses, client_secret_num_uses_limit, client_secret_ttl, \
    is_client_secret_revoked, created_at, updated_at";

const TOKEN_COLUMNS: &str = "id, identity_id, auth_method, auth_config_id, client_secret_id, \
    issued_at, expires_at, max_expires_at, access_token_ttl, access_token_max_ttl, \
    access_token_period, access_token_num_uses, access_token_num_uses_limit, \
    access_token_trusted_ips, is_access_token_revoked, access_token_last_used_at";

const GCP_COLUMNS: &str = "id, identity_id, type, allowed_service_accounts, allowed_projects, \
    allowed_zones, access_token_ttl, access_token_max_ttl, access_token_num_uses_limit, \
    access_token_period, access_token_trusted_ips, created_at, updated_at";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a small pool to `dsn`.
    ///
    /// # Errors
    /// Returns an error if the database is unreachable.
    pub async fn connect(dsn: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(5)
            .max_lifetime(Duration::from_secs(60 * 2))
            .test_before_acquire(true)
            .connect(dsn)
            .await
            .context("Failed to connect to database")?;
        Ok(Self::new(pool))
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, AuthError> {
        Ok(self.pool.begin().await?)
    }
}

fn db_span(operation: &'static str, table: &'static str) -> Span {
    info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.sql.table = table
    )
}

fn to_db(value: u64) -> Result<i64, AuthError> {
    i64::try_from(value).map_err(|_| AuthError::validation(format!("{value} is out of range")))
}

fn get_u64(row: &PgRow, column: &str) -> Result<u64, AuthError> {
    let value: i64 = row.try_get(column)?;
    u64::try_from(value).map_err(|_| AuthError::Store(anyhow!("negative value in {column}")))
}

fn get_ips(row: &PgRow, column: &str) -> Result<TrustedIpList, AuthError> {
    let Json(entries): Json<Vec<TrustedIp>> = row.try_get(column)?;
    TrustedIpList::new(entries)
        .map_err(|err| AuthError::Store(anyhow!("invalid trusted IPs in {column}: {err}")))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

fn universal_auth_from_row(row: &PgRow) -> Result<UniversalAuthConfig, AuthError> {
    Ok(UniversalAuthConfig {
        id: row.try_get("id")?,
        identity_id: row.try_get("identity_id")?,
        client_id: row.try_get("client_id")?,
        policy: TokenPolicy {
            access_token_ttl: get_u64(row, "access_token_ttl")?,
            access_token_max_ttl: get_u64(row, "access_token_max_ttl")?,
            access_token_num_uses_limit: get_u64(row, "access_token_num_uses_limit")?,
            access_token_period: get_u64(row, "access_token_period")?,
            access_token_trusted_ips: get_ips(row, "access_token_trusted_ips")?,
        },
        client_secret_trusted_ips: get_ips(row, "client_secret_trusted_ips")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn client_secret_from_row(row: &PgRow) -> Result<ClientSecret, AuthError> {
    Ok(ClientSecret {
        id: row.try_get("id")?,
        identity_ua_id: row.try_get("identity_ua_id")?,
        identity_id: row.try_get("identity_id")?,
        description: row.try_get("description")?,
        prefix: row.try_get("client_secret_prefix")?,
        hash: row.try_get("client_secret_hash")?,
        num_uses: get_u64(row, "client_secret_num_uses")?,
        num_uses_limit: get_u64(row, "client_secret_num_uses_limit")?,
        ttl: get_u64(row, "client_secret_ttl")?,
        is_revoked: row.try_get("is_client_secret_revoked")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn access_token_from_row(row: &PgRow) -> Result<AccessTokenRecord, AuthError> {
    let auth_method: String = row.try_get("auth_method")?;
    Ok(AccessTokenRecord {
        id: row.try_get("id")?,
        identity_id: row.try_get("identity_id")?,
        auth_method: auth_method
            .parse::<AuthMethod>()
            .map_err(|err| AuthError::Store(anyhow!("{err}")))?,
        auth_config_id: row.try_get("auth_config_id")?,
        client_secret_id: row.try_get("client_secret_id")?,
        issued_at: row.try_get("issued_at")?,
        expires_at: row.try_get("expires_at")?,
        max_expires_at: row.try_get("max_expires_at")?,
        ttl: get_u64(row, "access_token_ttl")?,
        max_ttl: get_u64(row, "access_token_max_ttl")?,
        period: get_u64(row, "access_token_period")?,
        num_uses: get_u64(row, "access_token_num_uses")?,
        num_uses_limit: get_u64(row, "access_token_num_uses_limit")?,
        trusted_ips: get_ips(row, "access_token_trusted_ips")?,
        is_revoked: row.try_get("is_access_token_revoked")?,
        last_used_at: row.try_get("access_token_last_used_at")?,
    })
}

fn gcp_auth_from_row(row: &PgRow) -> Result<GcpAuthConfig, AuthError> {
    let auth_type: String = row.try_get("type")?;
    let auth_type = match auth_type.as_str() {
        "gce" => GcpAuthType::Gce,
        "iam" => GcpAuthType::Iam,
        other => return Err(AuthError::Store(anyhow!("unknown gcp auth type: {other}"))),
    };
    Ok(GcpAuthConfig {
        id: row.try_get("id")?,
        identity_id: row.try_get("identity_id")?,
        auth_type,
        allowed_service_accounts: row.try_get("allowed_service_accounts")?,
        allowed_projects: row.try_get("allowed_projects")?,
        allowed_zones: row.try_get("allowed_zones")?,
        policy: TokenPolicy {
            access_token_ttl: get_u64(row, "access_token_ttl")?,
            access_token_max_ttl: get_u64(row, "access_token_max_ttl")?,
            access_token_num_uses_limit: get_u64(row, "access_token_num_uses_limit")?,
            access_token_period: get_u64(row, "access_token_period")?,
            access_token_trusted_ips: get_ips(row, "access_token_trusted_ips")?,
        },
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

async fn insert_token(
    tx: &mut Transaction<'static, Postgres>,
    token: &AccessTokenRecord,
) -> Result<(), AuthError> {
    let query = format!(
        "INSERT INTO identity_access_tokens ({TOKEN_COLUMNS}) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)"
    );
    sqlx::query(&query)
        .bind(token.id)
        .bind(token.identity_id)
        .bind(token.auth_method.as_str())
        .bind(token.auth_config_id)
        .bind(token.client_secret_id)
        .bind(token.issued_at)
        .bind(token.expires_at)
        .bind(token.max_expires_at)
        .bind(to_db(token.ttl)?)
        .bind(to_db(token.max_ttl)?)
        .bind(to_db(token.period)?)
        .bind(to_db(token.num_uses)?)
        .bind(to_db(token.num_uses_limit)?)
        .bind(Json(token.trusted_ips.entries()))
        .bind(token.is_revoked)
        .bind(token.last_used_at)
        .execute(&mut **tx)
        .instrument(db_span("INSERT", "identity_access_tokens"))
        .await?;
    Ok(())
}

#[async_trait]
impl Store for PgStore {
    async fn ping(&self) -> Result<(), AuthError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .instrument(db_span("SELECT", "none"))
            .await?;
        Ok(())
    }

    async fn insert_universal_auth(&self, config: &UniversalAuthConfig) -> Result<(), AuthError> {
        let query = format!(
            "INSERT INTO identity_universal_auths ({UA_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"
        );
        let result = sqlx::query(&query)
            .bind(config.id)
            .bind(config.identity_id)
            .bind(config.client_id)
            .bind(to_db(config.policy.access_token_ttl)?)
            .bind(to_db(config.policy.access_token_max_ttl)?)
            .bind(to_db(config.policy.access_token_num_uses_limit)?)
            .bind(to_db(config.policy.access_token_period)?)
            .bind(Json(config.client_secret_trusted_ips.entries()))
            .bind(Json(config.policy.access_token_trusted_ips.entries()))
            .bind(config.created_at)
            .bind(config.updated_at)
            .execute(&self.pool)
            .instrument(db_span("INSERT", "identity_universal_auths"))
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(AuthError::AlreadyAttached("universal auth")),
            Err(err) => Err(err.into()),
        }
    }

    async fn find_universal_auth(
        &self,
        identity_id: Uuid,
    ) -> Result<Option<UniversalAuthConfig>, AuthError> {
        let query = format!("SELECT {UA_COLUMNS} FROM identity_universal_auths WHERE identity_id = $1");
        sqlx::query(&query)
            .bind(identity_id)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", "identity_universal_auths"))
            .await?
            .as_ref()
            .map(universal_auth_from_row)
            .transpose()
    }

    async fn find_universal_auth_by_client_id(
        &self,
        client_id: Uuid,
    ) -> Result<Option<UniversalAuthConfig>, AuthError> {
        let query = format!("SELECT {UA_COLUMNS} FROM identity_universal_auths WHERE client_id = $1");
        sqlx::query(&query)
            .bind(client_id)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", "identity_universal_auths"))
            .await?
            .as_ref()
            .map(universal_auth_from_row)
            .transpose()
    }

    async fn update_universal_auth(
        &self,
        identity_id: Uuid,
        update: &ConfigUpdate<'_, UniversalAuthConfig>,
    ) -> Result<UniversalAuthConfig, AuthError> {
        let mut tx = self.begin().await?;
        let select = format!(
            "SELECT {UA_COLUMNS} FROM identity_universal_auths WHERE identity_id = $1 FOR UPDATE"
        );
        let row = sqlx::query(&select)
            .bind(identity_id)
            .fetch_optional(&mut *tx)
            .instrument(db_span("SELECT", "identity_universal_auths"))
            .await?
            .ok_or(AuthError::NotFound("universal auth"))?;
        let updated = update(&universal_auth_from_row(&row)?)?;

        sqlx::query(
            r"
            UPDATE identity_universal_auths
            SET access_token_ttl = $2,
                access_token_max_ttl = $3,
                access_token_num_uses_limit = $4,
                access_token_period = $5,
                client_secret_trusted_ips = $6,
                access_token_trusted_ips = $7,
                updated_at = $8
            WHERE id = $1
            ",
        )
        .bind(updated.id)
        .bind(to_db(updated.policy.access_token_ttl)?)
        .bind(to_db(updated.policy.access_token_max_ttl)?)
        .bind(to_db(updated.policy.access_token_num_uses_limit)?)
        .bind(to_db(updated.policy.access_token_period)?)
        .bind(Json(updated.client_secret_trusted_ips.entries()))
        .bind(Json(updated.policy.access_token_trusted_ips.entries()))
        .bind(updated.updated_at)
        .execute(&mut *tx)
        .instrument(db_span("UPDATE", "identity_universal_auths"))
        .await?;

        tx.commit().await?;
        Ok(updated)
    }

    async fn revoke_universal_auth(
        &self,
        identity_id: Uuid,
        now: OffsetDateTime,
    ) -> Result<UniversalAuthConfig, AuthError> {
        let mut tx = self.begin().await?;
        let delete = format!(
            "DELETE FROM identity_universal_auths WHERE identity_id = $1 RETURNING {UA_COLUMNS}"
        );
        let row = sqlx::query(&delete)
            .bind(identity_id)
            .fetch_optional(&mut *tx)
            .instrument(db_span("DELETE", "identity_universal_auths"))
            .await?
            .ok_or(AuthError::NotFound("universal auth"))?;
        let config = universal_auth_from_row(&row)?;

        sqlx::query(
            r"
            UPDATE identity_ua_client_secrets
            SET is_client_secret_revoked = true, updated_at = $2
            WHERE identity_ua_id = $1 AND NOT is_client_secret_revoked
            ",
        )
        .bind(config.id)
        .bind(now)
        .execute(&mut *tx)
        .instrument(db_span("UPDATE", "identity_ua_client_secrets"))
        .await?;

        tx.commit().await?;
        Ok(config)
    }

    async fn insert_client_secret(&self, secret: &ClientSecret) -> Result<(), AuthError> {
        let query = format!(
            "INSERT INTO identity_ua_client_secrets ({SECRET_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"
        );
        sqlx::query(&query)
            .bind(secret.id)
            .bind(secret.identity_ua_id)
            .bind(secret.identity_id)
            .bind(&secret.description)
            .bind(&secret.prefix)
            .bind(&secret.hash)
            .bind(to_db(secret.num_uses)?)
            .bind(to_db(secret.num_uses_limit)?)
            .bind(to_db(secret.ttl)?)
            .bind(secret.is_revoked)
            .bind(secret.created_at)
            .bind(secret.updated_at)
            .execute(&self.pool)
            .instrument(db_span("INSERT", "identity_ua_client_secrets"))
            .await?;
        Ok(())
    }

    async fn list_client_secrets(
        &self,
        identity_ua_id: Uuid,
    ) -> Result<Vec<ClientSecret>, AuthError> {
        let query = format!(
            "SELECT {SECRET_COLUMNS} FROM identity_ua_client_secrets \
             WHERE identity_ua_id = $1 ORDER BY created_at, id"
        );
        sqlx::query(&query)
            .bind(identity_ua_id)
            .fetch_all(&self.pool)
            .instrument(db_span("SELECT", "identity_ua_client_secrets"))
            .await?
            .iter()
            .map(client_secret_from_row)
            .collect()
    }

    async fn find_client_secret(
        &self,
        identity_ua_id: Uuid,
        secret_id: Uuid,
    ) -> Result<Option<ClientSecret>, AuthError> {
        let query = format!(
            "SELECT {SECRET_COLUMNS} FROM identity_ua_client_secrets \
             WHERE id = $1 AND identity_ua_id = $2"
        );
        sqlx::query(&query)
            .bind(secret_id)
            .bind(identity_ua_id)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", "identity_ua_client_secrets"))
            .await?
            .as_ref()
            .map(client_secret_from_row)
            .transpose()
    }

    async fn revoke_client_secret(
        &self,
        identity_ua_id: Uuid,
        secret_id: Uuid,
        now: OffsetDateTime,
    ) -> Result<Option<ClientSecret>, AuthError> {
        // The first revocation's timestamp is the one kept.
        let query = format!(
            "UPDATE identity_ua_client_secrets \
             SET updated_at = CASE WHEN is_client_secret_revoked THEN updated_at ELSE $3 END, \
                 is_client_secret_revoked = true \
             WHERE id = $1 AND identity_ua_id = $2 \
             RETURNING {SECRET_COLUMNS}"
        );
        sqlx::query(&query)
            .bind(secret_id)
            .bind(identity_ua_id)
            .bind(now)
            .fetch_optional(&self.pool)
            .instrument(db_span("UPDATE", "identity_ua_client_secrets"))
            .await?
            .as_ref()
            .map(client_secret_from_row)
            .transpose()
    }

    async fn redeem_client_secret(
        &self,
        secret_id: Uuid,
        token: &AccessTokenRecord,
    ) -> Result<UseOutcome<()>, AuthError> {
        let now = token.issued_at;
        let mut tx = self.begin().await?;

        let counted = sqlx::query(
            r"
            UPDATE identity_ua_client_secrets
            SET client_secret_num_uses = client_secret_num_uses + 1, updated_at = $2
            WHERE id = $1
              AND NOT is_client_secret_revoked
              AND (client_secret_ttl = 0
                   OR created_at + client_secret_ttl * interval '1 second' >= $2)
              AND (client_secret_num_uses_limit = 0
                   OR client_secret_num_uses < client_secret_num_uses_limit)
            RETURNING id
            ",
        )
        .bind(secret_id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .instrument(db_span("UPDATE", "identity_ua_client_secrets"))
        .await?;

        if counted.is_some() {
            insert_token(&mut tx, token).await?;
            tx.commit().await?;
            return Ok(UseOutcome::Counted(()));
        }

        // Not counted: find out why, revoking the secret if its limit is spent.
        let select = format!(
            "SELECT {SECRET_COLUMNS} FROM identity_ua_client_secrets WHERE id = $1 FOR UPDATE"
        );
        let Some(row) = sqlx::query(&select)
            .bind(secret_id)
            .fetch_optional(&mut *tx)
            .instrument(db_span("SELECT", "identity_ua_client_secrets"))
            .await?
        else {
            return Ok(UseOutcome::Missing);
        };
        let secret = client_secret_from_row(&row)?;
        if secret.is_revoked {
            return Ok(UseOutcome::Revoked);
        }
        if secret.is_expired(now) {
            return Ok(UseOutcome::Expired);
        }

        sqlx::query(
            r"
            UPDATE identity_ua_client_secrets
            SET is_client_secret_revoked = true, updated_at = $2
            WHERE id = $1
            ",
        )
        .bind(secret_id)
        .bind(now)
        .execute(&mut *tx)
        .instrument(db_span("UPDATE", "identity_ua_client_secrets"))
        .await?;
        tx.commit().await?;
        Ok(UseOutcome::LimitExceeded)
    }

    async fn insert_access_token(&self, token: &AccessTokenRecord) -> Result<(), AuthError> {
        let mut tx = self.begin().await?;
        insert_token(&mut tx, token).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn find_access_token(
        &self,
        token_id: Uuid,
    ) -> Result<Option<AccessTokenRecord>, AuthError> {
        let query = format!("SELECT {TOKEN_COLUMNS} FROM identity_access_tokens WHERE id = $1");
        sqlx::query(&query)
            .bind(token_id)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", "identity_access_tokens"))
            .await?
            .as_ref()
            .map(access_token_from_row)
            .transpose()
    }

    async fn use_access_token(
        &self,
        token_id: Uuid,
        now: OffsetDateTime,
    ) -> Result<UseOutcome<AccessTokenRecord>, AuthError> {
        let mut tx = self.begin().await?;
        let select = format!(
            "SELECT {TOKEN_COLUMNS} FROM identity_access_tokens WHERE id = $1 FOR UPDATE"
        );
        let Some(row) = sqlx::query(&select)
            .bind(token_id)
            .fetch_optional(&mut *tx)
            .instrument(db_span("SELECT", "identity_access_tokens"))
            .await?
        else {
            return Ok(UseOutcome::Missing);
        };
        let mut token = access_token_from_row(&row)?;

        let renew: bool = if token.is_periodic() {
            sqlx::query_scalar(
                r"
                SELECT EXISTS (SELECT 1 FROM identity_universal_auths WHERE id = $1)
                    OR EXISTS (SELECT 1 FROM identity_gcp_auths WHERE id = $1)
                ",
            )
            .bind(token.auth_config_id)
            .fetch_one(&mut *tx)
            .instrument(db_span("SELECT", "identity_universal_auths"))
            .await?
        } else {
            false
        };

        let outcome = token.consume(now, renew);
        if matches!(outcome, UseOutcome::Counted(()) | UseOutcome::LimitExceeded) {
            sqlx::query(
                r"
                UPDATE identity_access_tokens
                SET access_token_num_uses = $2,
                    is_access_token_revoked = $3,
                    expires_at = $4,
                    access_token_last_used_at = $5
                WHERE id = $1
                ",
            )
            .bind(token.id)
            .bind(to_db(token.num_uses)?)
            .bind(token.is_revoked)
            .bind(token.expires_at)
            .bind(token.last_used_at)
            .execute(&mut *tx)
            .instrument(db_span("UPDATE", "identity_access_tokens"))
            .await?;
            tx.commit().await?;
        }
        Ok(outcome.map(|()| token))
    }

    async fn revoke_access_token(
        &self,
        token_id: Uuid,
        _now: OffsetDateTime,
    ) -> Result<Option<AccessTokenRecord>, AuthError> {
        let query = format!(
            "UPDATE identity_access_tokens SET is_access_token_revoked = true \
             WHERE id = $1 RETURNING {TOKEN_COLUMNS}"
        );
        sqlx::query(&query)
            .bind(token_id)
            .fetch_optional(&self.pool)
            .instrument(db_span("UPDATE", "identity_access_tokens"))
            .await?
            .as_ref()
            .map(access_token_from_row)
            .transpose()
    }

    async fn insert_gcp_auth(&self, config: &GcpAuthConfig) -> Result<(), AuthError> {
        let query = format!(
            "INSERT INTO identity_gcp_auths ({GCP_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"
        );
        let result = sqlx::query(&query)
            .bind(config.id)
            .bind(config.identity_id)
            .bind(config.auth_type.as_str())
            .bind(&config.allowed_service_accounts)
            .bind(&config.allowed_projects)
            .bind(&config.allowed_zones)
            .bind(to_db(config.policy.access_token_ttl)?)
            .bind(to_db(config.policy.access_token_max_ttl)?)
            .bind(to_db(config.policy.access_token_num_uses_limit)?)
            .bind(to_db(config.policy.access_token_period)?)
            .bind(Json(config.policy.access_token_trusted_ips.entries()))
            .bind(config.created_at)
            .bind(config.updated_at)
            .execute(&self.pool)
            .instrument(db_span("INSERT", "identity_gcp_auths"))
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(AuthError::AlreadyAttached("gcp auth")),
            Err(err) => Err(err.into()),
        }
    }

    async fn find_gcp_auth(&self, identity_id: Uuid) -> Result<Option<GcpAuthConfig>, AuthError> {
        let query = format!("SELECT {GCP_COLUMNS} FROM identity_gcp_auths WHERE identity_id = $1");
        sqlx::query(&query)
            .bind(identity_id)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", "identity_gcp_auths"))
            .await?
            .as_ref()
            .map(gcp_auth_from_row)
            .transpose()
    }

    async fn update_gcp_auth(
        &self,
        identity_id: Uuid,
        update: &ConfigUpdate<'_, GcpAuthConfig>,
    ) -> Result<GcpAuthConfig, AuthError> {
        let mut tx = self.begin().await?;
        let select = format!(
            "SELECT {GCP_COLUMNS} FROM identity_gcp_auths WHERE identity_id = $1 FOR UPDATE"
        );
        let row = sqlx::query(&select)
            .bind(identity_id)
            .fetch_optional(&mut *tx)
            .instrument(db_span("SELECT", "identity_gcp_auths"))
            .await?
            .ok_or(AuthError::NotFound("gcp auth"))?;
        let updated = update(&gcp_auth_from_row(&row)?)?;

        sqlx::query(
            r"
            UPDATE identity_gcp_auths
            SET type = $2,
                allowed_service_accounts = $3,
                allowed_projects = $4,
                allowed_zones = $5,
                access_token_ttl = $6,
                access_token_max_ttl = $7,
                access_token_num_uses_limit = $8,
                access_token_period = $9,
                access_token_trusted_ips = $10,
                updated_at = $11
            WHERE id = $1
            ",
        )
        .bind(updated.id)
        .bind(updated.auth_type.as_str())
        .bind(&updated.allowed_service_accounts)
        .bind(&updated.allowed_projects)
        .bind(&updated.allowed_zones)
        .bind(to_db(updated.policy.access_token_ttl)?)
        .bind(to_db(updated.policy.access_token_max_ttl)?)
        .bind(to_db(updated.policy.access_token_num_uses_limit)?)
        .bind(to_db(updated.policy.access_token_period)?)
        .bind(Json(updated.policy.access_token_trusted_ips.entries()))
        .bind(updated.updated_at)
        .execute(&mut *tx)
        .instrument(db_span("UPDATE", "identity_gcp_auths"))
        .await?;

        tx.commit().await?;
        Ok(updated)
    }

    async fn revoke_gcp_auth(&self, identity_id: Uuid) -> Result<GcpAuthConfig, AuthError> {
        let query = format!(
            "DELETE FROM identity_gcp_auths WHERE identity_id = $1 RETURNING {GCP_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(identity_id)
            .fetch_optional(&self.pool)
            .instrument(db_span("DELETE", "identity_gcp_auths"))
            .await?
            .ok_or(AuthError::NotFound("gcp auth"))?;
        gcp_auth_from_row(&row)
    }
}

fn member_key(actor: &Actor) -> (&'static str, Uuid) {
    match actor {
        Actor::User(id) => ("user", *id),
        Actor::Identity(id) => ("identity", *id),
        Actor::Operator => ("operator", Uuid::nil()),
    }
}

#[async_trait]
impl IdentityDirectory for PgStore {
    async fn find_identity(&self, identity_id: Uuid) -> Result<Option<IdentityRecord>, AuthError> {
        let row = sqlx::query("SELECT id, org_id FROM identities WHERE id = $1")
            .bind(identity_id)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", "identities"))
            .await?;
        row.map(|row| -> Result<IdentityRecord, AuthError> {
            Ok(IdentityRecord {
                id: row.try_get("id")?,
                org_id: row.try_get("org_id")?,
            })
        })
        .transpose()
    }

    async fn can_manage_identities(&self, actor: &Actor, org_id: Uuid) -> Result<bool, AuthError> {
        let (member_type, member_id) = member_key(actor);
        let allowed: Option<bool> = sqlx::query_scalar(
            r"
            SELECT can_manage_identities FROM org_members
            WHERE org_id = $1 AND member_type = $2 AND member_id = $3
            ",
        )
        .bind(org_id)
        .bind(member_type)
        .bind(member_id)
        .fetch_optional(&self.pool)
        .instrument(db_span("SELECT", "org_members"))
        .await?;
        Ok(allowed.unwrap_or(false))
    }

    async fn org_policy(&self, org_id: Uuid) -> Result<OrgPolicy, AuthError> {
        let ip_allowlisting: Option<bool> =
            sqlx::query_scalar("SELECT ip_allowlisting FROM org_policies WHERE org_id = $1")
                .bind(org_id)
                .fetch_optional(&self.pool)
                .instrument(db_span("SELECT", "org_policies"))
                .await?;
        Ok(OrgPolicy {
            ip_allowlisting: ip_allowlisting.unwrap_or(false),
        })
    }
}
