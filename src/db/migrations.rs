//! Schema migrations, embedded and applied at startup with `refinery`
//! (spec.md [EXPANDED]: the teacher's `Store::run_migrations` only logs
//! "migrations should be run via refinery migrate -c refinery.toml" — this
//! crate actually wires it up instead of leaving that as a comment).

use crate::error::DatabaseError;

refinery::embed_migrations!("./migrations");

/// Apply any migration versions newer than what's recorded in the
/// database's `refinery_schema_history` table. Idempotent: running it
/// against an already-current database is a no-op.
pub async fn run(conn: &mut deadpool_postgres::Object) -> Result<(), DatabaseError> {
    let report = migrations::runner()
        .run_async(&mut ***conn)
        .await
        .map_err(|e| DatabaseError::Migration(e.to_string()))?;

    for applied in report.applied_migrations() {
        tracing::info!(version = applied.version(), name = applied.name(), "applied migration");
    }
    Ok(())
}
