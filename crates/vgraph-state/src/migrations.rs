//! SurrealDB schema migrations and initialization
//!
//! Sets up the change-set table, one table per versioned entity kind, and the
//! fix batch table. Safe to call on every connection.

use crate::schema::EntityTable;
use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

/// Initialize all vgraph tables in SurrealDB
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing vgraph SurrealDB schema");

    init_change_sets_table(db).await?;
    for table in EntityTable::ALL {
        init_versioned_table(db, table).await?;
    }
    init_fix_batches_table(db).await?;

    info!("vgraph schema initialization complete");
    Ok(())
}

/// Initialize `change_sets`
///
/// Schema:
/// ```text
/// TABLE change_sets {
///   pk:           STRING (unique; never the nil uuid, which is HEAD)
///   name:         STRING
///   status:       STRING (enum: open | applied | canceled)
///   created_at:   STRING (RFC 3339)
///   applied_at:   STRING?
///   canceled_at:  STRING?
/// }
/// ```
///
/// Constraints:
/// - `status` transitions: open → applied | canceled (enforced via app logic)
/// - Change sets are never deleted; terminal records are the only memory of
///   an extinct branch
async fn init_change_sets_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing change_sets table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS change_sets AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update FULL
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_change_set_pk ON TABLE change_sets COLUMNS pk UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_change_set_status ON TABLE change_sets COLUMNS status;
    "#;

    db.query(sql).await?;
    info!("✓ change_sets table initialized");
    Ok(())
}

/// Initialize one versioned entity table
///
/// Schema:
/// ```text
/// TABLE <entity> {
///   pk:                        STRING (unique row id)
///   entity_id:                 STRING (stable across change sets)
///   table:                     STRING
///   tenancy_universal:         BOOL
///   tenancy_billing_account_pk STRING?
///   tenancy_organization_pk:   STRING?
///   tenancy_workspace_pk:      STRING?
///   visibility_change_set_pk:  STRING (nil uuid = HEAD)
///   visibility_deleted_at:     STRING?
///   object:                    OBJECT
///   created_at:                STRING (RFC 3339)
///   updated_at:                STRING (RFC 3339)
/// }
/// ```
///
/// Constraints:
/// - `visibility_change_set_pk` references HEAD or an existing change set
///   (enforced via app logic before every write)
/// - at most one live row per `(entity_id, visibility_change_set_pk)`
///   (enforced via copy-on-write in the graph store)
async fn init_versioned_table(db: &Surreal<Any>, table: EntityTable) -> Result<()> {
    debug!("Initializing {} table", table);

    let name = table.as_str();
    let sql = format!(
        r#"
        DEFINE TABLE IF NOT EXISTS {name} AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update FULL
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_{name}_pk ON TABLE {name} COLUMNS pk UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_{name}_entity ON TABLE {name} COLUMNS entity_id;
        DEFINE INDEX IF NOT EXISTS idx_{name}_visibility ON TABLE {name} COLUMNS visibility_change_set_pk;
        DEFINE INDEX IF NOT EXISTS idx_{name}_entity_visibility ON TABLE {name} COLUMNS entity_id, visibility_change_set_pk;
    "#
    );

    db.query(sql).await?;
    info!("✓ {} table initialized", table);
    Ok(())
}

/// Initialize `fix_batches`
///
/// Each document holds the batch and its member executions so the
/// completion check and the member update land in a single write.
async fn init_fix_batches_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing fix_batches table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS fix_batches AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update FULL
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_batch_id ON TABLE fix_batches COLUMNS batch_id UNIQUE;
    "#;

    db.query(sql).await?;
    info!("✓ fix_batches table initialized");
    Ok(())
}
