//! Flow definition and flow version queries.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::{
    DbError,
    models::{FlowContent, FlowRow, FlowVersionRow},
};

const FLOW_COLUMNS: &str =
    "id, name, version, trigger, nodes, edges, created_at, updated_at";

// ---------------------------------------------------------------------------
// flows
// ---------------------------------------------------------------------------

/// Insert a brand-new flow head at version 1.
pub async fn insert_flow(
    conn: &mut PgConnection,
    name: &str,
    trigger: serde_json::Value,
    nodes: serde_json::Value,
    edges: serde_json::Value,
    now: DateTime<Utc>,
) -> Result<FlowRow, DbError> {
    let row = sqlx::query_as::<_, FlowRow>(&format!(
        r#"
        INSERT INTO flows (id, name, version, trigger, nodes, edges, created_at, updated_at)
        VALUES ($1, $2, 1, $3, $4, $5, $6, $6)
        RETURNING {FLOW_COLUMNS}
        "#
    ))
    .bind(Uuid::new_v4())
    .bind(name)
    .bind(trigger)
    .bind(nodes)
    .bind(edges)
    .bind(now)
    .fetch_one(conn)
    .await?;

    Ok(row)
}

/// Overwrite the head with new content and bump its version by one.
///
/// Callers must hold the row lock from [`lock_flow`] for the surrounding
/// transaction so the increment cannot be lost.
pub async fn bump_flow(
    conn: &mut PgConnection,
    id: Uuid,
    name: &str,
    trigger: serde_json::Value,
    nodes: serde_json::Value,
    edges: serde_json::Value,
    now: DateTime<Utc>,
) -> Result<FlowRow, DbError> {
    let row = sqlx::query_as::<_, FlowRow>(&format!(
        r#"
        UPDATE flows
        SET name = $2, trigger = $3, nodes = $4, edges = $5,
            version = version + 1, updated_at = $6
        WHERE id = $1
        RETURNING {FLOW_COLUMNS}
        "#
    ))
    .bind(id)
    .bind(name)
    .bind(trigger)
    .bind(nodes)
    .bind(edges)
    .bind(now)
    .fetch_optional(conn)
    .await?
    .ok_or(DbError::NotFound)?;

    Ok(row)
}

/// Fetch a single flow by its primary key.
pub async fn get_flow(conn: &mut PgConnection, id: Uuid) -> Result<FlowRow, DbError> {
    sqlx::query_as::<_, FlowRow>(&format!("SELECT {FLOW_COLUMNS} FROM flows WHERE id = $1"))
        .bind(id)
        .fetch_optional(conn)
        .await?
        .ok_or(DbError::NotFound)
}

/// Fetch and row-lock a flow for the rest of the current transaction.
pub async fn lock_flow(conn: &mut PgConnection, id: Uuid) -> Result<FlowRow, DbError> {
    sqlx::query_as::<_, FlowRow>(&format!(
        "SELECT {FLOW_COLUMNS} FROM flows WHERE id = $1 FOR UPDATE"
    ))
    .bind(id)
    .fetch_optional(conn)
    .await?
    .ok_or(DbError::NotFound)
}

/// Fetch and row-lock a flow by its unique name, if one exists.
pub async fn lock_flow_by_name(
    conn: &mut PgConnection,
    name: &str,
) -> Result<Option<FlowRow>, DbError> {
    let row = sqlx::query_as::<_, FlowRow>(&format!(
        "SELECT {FLOW_COLUMNS} FROM flows WHERE name = $1 FOR UPDATE"
    ))
    .bind(name)
    .fetch_optional(conn)
    .await?;

    Ok(row)
}

/// Return all flows, most recently updated first.
pub async fn list_flows(conn: &mut PgConnection) -> Result<Vec<FlowRow>, DbError> {
    let rows = sqlx::query_as::<_, FlowRow>(&format!(
        "SELECT {FLOW_COLUMNS} FROM flows ORDER BY updated_at DESC, name"
    ))
    .fetch_all(conn)
    .await?;

    Ok(rows)
}

// ---------------------------------------------------------------------------
// flow_versions
// ---------------------------------------------------------------------------

/// Append one snapshot to a flow's history.
pub async fn insert_flow_version(
    conn: &mut PgConnection,
    flow_id: Uuid,
    version: i32,
    content: &FlowContent,
    note: Option<&str>,
    now: DateTime<Utc>,
) -> Result<FlowVersionRow, DbError> {
    let row = sqlx::query_as::<_, FlowVersionRow>(
        r#"
        INSERT INTO flow_versions (id, flow_id, version, trigger, nodes, edges, note, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING id, flow_id, version, trigger, nodes, edges, note, created_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(flow_id)
    .bind(version)
    .bind(&content.trigger)
    .bind(&content.nodes)
    .bind(&content.edges)
    .bind(note)
    .bind(now)
    .fetch_one(conn)
    .await?;

    Ok(row)
}

/// All versions of a flow in ascending version order.
pub async fn list_flow_versions(
    conn: &mut PgConnection,
    flow_id: Uuid,
) -> Result<Vec<FlowVersionRow>, DbError> {
    let rows = sqlx::query_as::<_, FlowVersionRow>(
        r#"
        SELECT id, flow_id, version, trigger, nodes, edges, note, created_at
        FROM flow_versions
        WHERE flow_id = $1
        ORDER BY version ASC
        "#,
    )
    .bind(flow_id)
    .fetch_all(conn)
    .await?;

    Ok(rows)
}

pub async fn get_flow_version(
    conn: &mut PgConnection,
    flow_id: Uuid,
    version: i32,
) -> Result<FlowVersionRow, DbError> {
    sqlx::query_as::<_, FlowVersionRow>(
        r#"
        SELECT id, flow_id, version, trigger, nodes, edges, note, created_at
        FROM flow_versions
        WHERE flow_id = $1 AND version = $2
        "#,
    )
    .bind(flow_id)
    .bind(version)
    .fetch_optional(conn)
    .await?
    .ok_or(DbError::NotFound)
}
