//! Repository functions: one function per database operation.
//!
//! Every function takes a `&mut PgConnection` (a pooled connection or an
//! open transaction) and returns a `Result<T, DbError>`.
//! No business logic, no domain types: pure SQL.

pub mod flows;
pub mod tasks;
pub mod steps;
pub mod outbox;
