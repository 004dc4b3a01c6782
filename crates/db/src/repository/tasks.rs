//! Task instance and DAG execution node queries.

use chrono::{DateTime, Utc};
use sqlx::{PgConnection, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::{
    DbError,
    models::{DagNodeRow, NewTaskRow, TaskRow},
};

/// Every task read goes through this projection so `pending_steps` is always
/// computed from `human_steps` rather than trusted from a stored flag.
const TASK_SELECT: &str = r#"
    SELECT t.id, t.title, t.flow_name, t.status, t.current_step, t.assignee,
           t.due_date, t.created_at, t.updated_at, t.completed_at,
           (SELECT COUNT(*) FROM human_steps s
             WHERE s.task_id = t.id AND s.status = 'pending') AS pending_steps
    FROM task_instances t
"#;

const DAG_NODE_COLUMNS: &str = "id, task_id, seq, node_key, label, node_type, status, \
    source_keys, log, error, position, started_at, finished_at";

// ---------------------------------------------------------------------------
// task_instances
// ---------------------------------------------------------------------------

pub async fn insert_task(conn: &mut PgConnection, task: &NewTaskRow) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO task_instances
            (id, title, flow_name, status, current_step, assignee, due_date,
             created_at, updated_at, completed_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8, $9)
        "#,
    )
    .bind(task.id)
    .bind(&task.title)
    .bind(&task.flow_name)
    .bind(&task.status)
    .bind(&task.current_step)
    .bind(&task.assignee)
    .bind(task.due_date)
    .bind(task.created_at)
    .bind(task.completed_at)
    .execute(conn)
    .await?;

    Ok(())
}

pub async fn get_task(conn: &mut PgConnection, id: Uuid) -> Result<TaskRow, DbError> {
    sqlx::query_as::<_, TaskRow>(&format!("{TASK_SELECT} WHERE t.id = $1"))
        .bind(id)
        .fetch_optional(conn)
        .await?
        .ok_or(DbError::NotFound)
}

/// Fetch a task and hold its row lock until the transaction ends.
///
/// The task row is the lock boundary for every status roll-up.
pub async fn lock_task(conn: &mut PgConnection, id: Uuid) -> Result<TaskRow, DbError> {
    sqlx::query_as::<_, TaskRow>(&format!("{TASK_SELECT} WHERE t.id = $1 FOR UPDATE OF t"))
        .bind(id)
        .fetch_optional(conn)
        .await?
        .ok_or(DbError::NotFound)
}

/// Write the roll-up fields of a task.
pub async fn update_task_status(
    conn: &mut PgConnection,
    id: Uuid,
    status: &str,
    current_step: Option<&str>,
    completed_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    let result = sqlx::query(
        r#"
        UPDATE task_instances
        SET status = $2, current_step = $3, completed_at = $4, updated_at = $5
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(status)
    .bind(current_step)
    .bind(completed_at)
    .bind(now)
    .execute(conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }

    Ok(())
}

/// Filter applied by [`list_tasks`].
#[derive(Debug, Clone, Default)]
pub struct TaskListQuery {
    pub statuses: Vec<String>,
    pub assignee: Option<String>,
    pub search: Option<String>,
    pub oldest_first: bool,
    pub limit: i64,
    pub offset: i64,
}

fn push_task_filters(qb: &mut QueryBuilder<'_, Postgres>, query: &TaskListQuery) {
    qb.push(" WHERE TRUE");
    if !query.statuses.is_empty() {
        qb.push(" AND t.status = ANY(").push_bind(query.statuses.clone()).push(")");
    }
    if let Some(assignee) = &query.assignee {
        qb.push(" AND t.assignee = ").push_bind(assignee.clone());
    }
    if let Some(search) = &query.search {
        let pattern = format!("%{search}%");
        qb.push(" AND (t.title ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR t.flow_name ILIKE ")
            .push_bind(pattern)
            .push(")");
    }
}

/// Return one page of tasks plus the total number of matching rows.
pub async fn list_tasks(
    conn: &mut PgConnection,
    query: &TaskListQuery,
) -> Result<(Vec<TaskRow>, i64), DbError> {
    let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM task_instances t");
    push_task_filters(&mut count, query);
    let total: i64 = count.build_query_scalar().fetch_one(&mut *conn).await?;

    let mut page = QueryBuilder::<Postgres>::new(TASK_SELECT);
    push_task_filters(&mut page, query);
    page.push(if query.oldest_first {
        " ORDER BY t.created_at ASC"
    } else {
        " ORDER BY t.created_at DESC"
    });
    page.push(" LIMIT ").push_bind(query.limit);
    page.push(" OFFSET ").push_bind(query.offset);

    let rows = page.build_query_as::<TaskRow>().fetch_all(&mut *conn).await?;

    Ok((rows, total))
}

// ---------------------------------------------------------------------------
// dag_execution_nodes
// ---------------------------------------------------------------------------

pub async fn insert_dag_node(conn: &mut PgConnection, node: &DagNodeRow) -> Result<(), DbError> {
    sqlx::query(&format!(
        r#"
        INSERT INTO dag_execution_nodes ({DAG_NODE_COLUMNS})
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        "#
    ))
    .bind(node.id)
    .bind(node.task_id)
    .bind(node.seq)
    .bind(&node.node_key)
    .bind(&node.label)
    .bind(&node.node_type)
    .bind(&node.status)
    .bind(&node.source_keys)
    .bind(&node.log)
    .bind(&node.error)
    .bind(&node.position)
    .bind(node.started_at)
    .bind(node.finished_at)
    .execute(conn)
    .await?;

    Ok(())
}

/// A task's execution nodes in flow declaration order.
pub async fn list_dag_nodes(
    conn: &mut PgConnection,
    task_id: Uuid,
) -> Result<Vec<DagNodeRow>, DbError> {
    let rows = sqlx::query_as::<_, DagNodeRow>(&format!(
        "SELECT {DAG_NODE_COLUMNS} FROM dag_execution_nodes WHERE task_id = $1 ORDER BY seq"
    ))
    .bind(task_id)
    .fetch_all(conn)
    .await?;

    Ok(rows)
}
