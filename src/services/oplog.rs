use crate::db::connection::DbPool;
use crate::services::event_log::{self, LogContext};
use crate::services::mongo_tools;
use bson::{doc, Bson, Document};
use futures_util::TryStreamExt;
use mongodb::Client;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;

/// BSON logical timestamp: seconds plus an ordinal for operations within
/// the same second. This is the replication-log cursor, persisted packed
/// the way MongoDB itself packs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct OplogTimestamp {
    pub time: u32,
    pub increment: u32,
}

impl OplogTimestamp {
    pub fn packed(&self) -> i64 {
        ((self.time as i64) << 32) | self.increment as i64
    }

    pub fn from_packed(packed: i64) -> Self {
        Self {
            time: (packed >> 32) as u32,
            increment: (packed & 0xffff_ffff) as u32,
        }
    }

    /// Fallback cursor for records created before exact oplog positions
    /// were persisted: wall-clock ms truncated to seconds, increment 0.
    pub fn from_wall_clock_ms(ms: i64) -> Self {
        Self {
            time: (ms / 1000) as u32,
            increment: 0,
        }
    }

    /// Extended-JSON query selecting entries strictly after this position.
    pub fn slice_query(&self) -> String {
        format!(
            r#"{{ "ts": {{ "$gt": {{ "$timestamp": {{ "t": {}, "i": {} }} }} }} }}"#,
            self.time, self.increment
        )
    }
}

impl From<bson::Timestamp> for OplogTimestamp {
    fn from(ts: bson::Timestamp) -> Self {
        Self {
            time: ts.time,
            increment: ts.increment,
        }
    }
}

/// Why an oplog entry was not applied. Skips are expected steady-state
/// behavior, surfaced in counts rather than raised as errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Noop,
    MissingNamespace,
    SystemNamespace,
    InvalidNamespace,
    MissingTargetId,
    MissingDocument,
    /// `$v: 2` delta-patch updates cannot be reconstructed; restored
    /// state may lack delta-only changes.
    UnsupportedDiffUpdate,
    /// Deletes inside applyOps/transaction batches are suppressed so a
    /// replayed batch can never wipe pre-existing target data.
    SuppressedDelete,
    /// drop / dropDatabase / createIndexes are never replayed.
    DestructiveCommand,
    UnsupportedCommand,
    UnknownOp,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OplogAction {
    Insert {
        db: String,
        coll: String,
        document: Document,
    },
    UpdateOperators {
        db: String,
        coll: String,
        id: Bson,
        update: Document,
    },
    ReplaceUpsert {
        db: String,
        coll: String,
        id: Bson,
        document: Document,
    },
    Delete {
        db: String,
        coll: String,
        id: Bson,
    },
    CreateCollection {
        db: String,
        name: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlannedOp {
    Apply(OplogAction),
    Skip(SkipReason),
}

/// Classify one raw oplog entry into the operations to execute against
/// the target. applyOps batches unpack into one planned op per nested
/// entry. Pure over the BSON document so the dispatch rules are testable
/// without a live server.
pub fn plan_entry(entry: &Document) -> Vec<PlannedOp> {
    let op = entry.get_str("op").unwrap_or("");
    let ns = entry.get_str("ns").unwrap_or("");

    if op == "n" {
        return vec![PlannedOp::Skip(SkipReason::Noop)];
    }
    if ns.is_empty() {
        return vec![PlannedOp::Skip(SkipReason::MissingNamespace)];
    }

    // applyOps is checked before the system-namespace filter: transaction
    // batches arrive under admin.$cmd and carry the real operations
    // nested inside.
    if op == "c" {
        if let Ok(o) = entry.get_document("o") {
            if let Ok(ops) = o.get_array("applyOps") {
                return ops
                    .iter()
                    .map(|nested| match nested {
                        Bson::Document(d) => plan_crud(d, true),
                        _ => PlannedOp::Skip(SkipReason::UnknownOp),
                    })
                    .collect();
            }
        }
    }

    if ns.starts_with("config.") || ns.starts_with("local.") || ns.starts_with("admin.") {
        return vec![PlannedOp::Skip(SkipReason::SystemNamespace)];
    }

    if op == "c" {
        return vec![plan_command(ns, entry.get_document("o").ok())];
    }

    vec![plan_crud(entry, false)]
}

/// Schema-level commands: collection creation is replayed, destructive
/// commands never are. Restore must not destroy pre-existing target data
/// as a side effect of an oplog command.
fn plan_command(ns: &str, o: Option<&Document>) -> PlannedOp {
    let db = match ns.split_once('.') {
        Some((db, _)) if !db.is_empty() => db,
        _ => return PlannedOp::Skip(SkipReason::InvalidNamespace),
    };
    let Some(o) = o else {
        return PlannedOp::Skip(SkipReason::MissingDocument);
    };

    if let Ok(name) = o.get_str("create") {
        return PlannedOp::Apply(OplogAction::CreateCollection {
            db: db.to_string(),
            name: name.to_string(),
        });
    }
    if o.contains_key("drop") || o.contains_key("dropDatabase") || o.contains_key("createIndexes") {
        return PlannedOp::Skip(SkipReason::DestructiveCommand);
    }
    PlannedOp::Skip(SkipReason::UnsupportedCommand)
}

fn plan_crud(entry: &Document, in_apply_ops: bool) -> PlannedOp {
    let op = entry.get_str("op").unwrap_or("");
    let ns = entry.get_str("ns").unwrap_or("");

    if ns.is_empty() {
        return PlannedOp::Skip(SkipReason::MissingNamespace);
    }
    if ns.starts_with("config.") || ns.starts_with("local.") || ns.starts_with("admin.") {
        return PlannedOp::Skip(SkipReason::SystemNamespace);
    }
    // Collection names may themselves contain dots; only the first dot
    // separates the database.
    let (db, coll) = match ns.split_once('.') {
        Some((db, coll)) if !db.is_empty() && !coll.is_empty() && coll != "$cmd" => (db, coll),
        _ => return PlannedOp::Skip(SkipReason::InvalidNamespace),
    };

    match op {
        "i" => match entry.get_document("o") {
            Ok(document) => PlannedOp::Apply(OplogAction::Insert {
                db: db.to_string(),
                coll: coll.to_string(),
                document: document.clone(),
            }),
            Err(_) => PlannedOp::Skip(SkipReason::MissingDocument),
        },
        "u" => {
            let Ok(o) = entry.get_document("o") else {
                return PlannedOp::Skip(SkipReason::MissingDocument);
            };
            let id = entry
                .get_document("o2")
                .ok()
                .and_then(|o2| o2.get("_id").cloned());
            let Some(id) = id else {
                return PlannedOp::Skip(SkipReason::MissingTargetId);
            };
            if o.contains_key("diff")
                || matches!(o.get("$v"), Some(Bson::Int32(2)) | Some(Bson::Int64(2)))
            {
                return PlannedOp::Skip(SkipReason::UnsupportedDiffUpdate);
            }
            if o.keys().any(|k| k.starts_with('$')) {
                PlannedOp::Apply(OplogAction::UpdateOperators {
                    db: db.to_string(),
                    coll: coll.to_string(),
                    id,
                    update: o.clone(),
                })
            } else {
                PlannedOp::Apply(OplogAction::ReplaceUpsert {
                    db: db.to_string(),
                    coll: coll.to_string(),
                    id,
                    document: o.clone(),
                })
            }
        }
        "d" => {
            if in_apply_ops {
                return PlannedOp::Skip(SkipReason::SuppressedDelete);
            }
            match entry.get_document("o").ok().and_then(|o| o.get("_id").cloned()) {
                Some(id) => PlannedOp::Apply(OplogAction::Delete {
                    db: db.to_string(),
                    coll: coll.to_string(),
                    id,
                }),
                None => PlannedOp::Skip(SkipReason::MissingTargetId),
            }
        }
        "n" => PlannedOp::Skip(SkipReason::Noop),
        _ => PlannedOp::Skip(SkipReason::UnknownOp),
    }
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct ApplyStats {
    pub applied: u64,
    pub skipped: u64,
    pub errors: u64,
}

/// Dump the replication log strictly after `since` into a compressed
/// archive. Returns `None` when the slice is empty: the caller records
/// the backup as skipped and must not replay the (absent) artifact.
pub async fn capture_slice(
    mongo_url: &str,
    since: OplogTimestamp,
    out_path: &Path,
    timeout: Duration,
) -> anyhow::Result<Option<u64>> {
    let query = since.slice_query();
    let stderr = mongo_tools::dump_oplog_slice(mongo_url, out_path, &query, timeout).await?;

    if !tokio::fs::try_exists(out_path).await.unwrap_or(false) {
        return Ok(None);
    }
    // mongodump creates the archive before it knows the match count; a
    // zero-entry dump leaves a valid but useless file behind.
    if stderr.contains("(0 documents)") {
        let _ = tokio::fs::remove_file(out_path).await;
        return Ok(None);
    }
    let size = tokio::fs::metadata(out_path).await?.len();
    Ok(Some(size))
}

/// Current top of the replication log, captured after a backup completes
/// so the next incremental slices from the exact logical position instead
/// of a wall-clock approximation.
pub async fn latest_oplog_timestamp(mongo_url: &str) -> anyhow::Result<Option<OplogTimestamp>> {
    let client = Client::with_uri_str(mongo_tools::ensure_auth_source(mongo_url)).await?;
    let coll = client.database("local").collection::<Document>("oplog.rs");
    let mut cursor = coll
        .find(doc! {})
        .sort(doc! { "$natural": -1 })
        .limit(1)
        .await?;
    if let Some(entry) = cursor.try_next().await? {
        if let Ok(ts) = entry.get_timestamp("ts") {
            return Ok(Some(ts.into()));
        }
    }
    Ok(None)
}

/// Replay an oplog slice archive against the live target.
///
/// The archive is staged into a scratch database first (never replayed
/// from the stream), iterated in ascending `ts` order, and the scratch
/// database is dropped on success and failure alike.
pub async fn apply_slice(
    log_db: &DbPool,
    mongo_url: &str,
    archive_path: &Path,
    timeout: Duration,
) -> anyhow::Result<ApplyStats> {
    let scratch_db = format!("_oplog_restore_{}", chrono::Utc::now().timestamp_millis());

    mongo_tools::restore_oplog_to_scratch(mongo_url, archive_path, &scratch_db, timeout).await?;

    let client = Client::with_uri_str(mongo_url).await?;
    let result = replay_scratch(log_db, &client, &scratch_db).await;

    if let Err(e) = client.database(&scratch_db).drop().await {
        tracing::warn!(scratch_db = %scratch_db, "Failed to drop scratch database: {}", e);
    }

    result
}

async fn replay_scratch(
    log_db: &DbPool,
    client: &Client,
    scratch_db: &str,
) -> anyhow::Result<ApplyStats> {
    let staged = client.database(scratch_db).collection::<Document>("oplog");

    let count = staged.count_documents(doc! {}).await?;
    if count == 0 {
        event_log::warning(log_db, "Staged oplog is empty. No changes to apply.", LogContext::default());
        return Ok(ApplyStats::default());
    }
    event_log::info(
        log_db,
        &format!("Found {} oplog entries to apply", count),
        LogContext::default(),
    );

    // Ascending logical-time order is a correctness requirement: later
    // writes may depend on earlier ones.
    let mut cursor = staged.find(doc! {}).sort(doc! { "ts": 1 }).await?;
    let mut stats = ApplyStats::default();

    while let Some(entry) = cursor.try_next().await? {
        for planned in plan_entry(&entry) {
            match planned {
                PlannedOp::Skip(reason) => {
                    stats.skipped += 1;
                    tracing::debug!(?reason, "Skipped oplog entry");
                }
                PlannedOp::Apply(action) => match execute_action(client, &action).await {
                    Ok(true) => stats.applied += 1,
                    Ok(false) => stats.skipped += 1,
                    Err(e) => {
                        stats.errors += 1;
                        tracing::warn!("Error applying oplog entry: {}", e);
                    }
                },
            }
        }
    }

    event_log::success(
        log_db,
        &format!(
            "Oplog replay completed: {} applied, {} skipped, {} errors",
            stats.applied, stats.skipped, stats.errors
        ),
        LogContext::default(),
    );
    Ok(stats)
}

/// Returns Ok(false) for benign no-ops (duplicate key on insert, target
/// collection already present) so replays stay idempotent.
async fn execute_action(client: &Client, action: &OplogAction) -> anyhow::Result<bool> {
    match action {
        OplogAction::Insert { db, coll, document } => {
            let target = client.database(db).collection::<Document>(coll);
            match target.insert_one(document.clone()).await {
                Ok(_) => Ok(true),
                Err(e) if is_duplicate_key(&e) => Ok(false),
                Err(e) => Err(e.into()),
            }
        }
        OplogAction::UpdateOperators { db, coll, id, update } => {
            let target = client.database(db).collection::<Document>(coll);
            target
                .update_one(doc! { "_id": id.clone() }, update.clone())
                .await?;
            Ok(true)
        }
        OplogAction::ReplaceUpsert { db, coll, id, document } => {
            let target = client.database(db).collection::<Document>(coll);
            target
                .replace_one(doc! { "_id": id.clone() }, document.clone())
                .upsert(true)
                .await?;
            Ok(true)
        }
        OplogAction::Delete { db, coll, id } => {
            let target = client.database(db).collection::<Document>(coll);
            // Absent documents are a no-op; delete_one reports zero
            // deletions without erroring.
            target.delete_one(doc! { "_id": id.clone() }).await?;
            Ok(true)
        }
        OplogAction::CreateCollection { db, name } => {
            match client.database(db).create_collection(name).await {
                Ok(()) => Ok(true),
                Err(e) if is_namespace_exists(&e) => Ok(false),
                Err(e) => Err(e.into()),
            }
        }
    }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    use mongodb::error::{ErrorKind, WriteFailure};
    matches!(
        &*err.kind,
        ErrorKind::Write(WriteFailure::WriteError(we)) if we.code == 11000
    )
}

fn is_namespace_exists(err: &mongodb::error::Error) -> bool {
    use mongodb::error::ErrorKind;
    matches!(&*err.kind, ErrorKind::Command(ce) if ce.code == 48)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert_entry(ns: &str, id: i32) -> Document {
        doc! { "op": "i", "ns": ns, "o": { "_id": id, "value": "x" } }
    }

    #[test]
    fn test_timestamp_pack_round_trip() {
        let ts = OplogTimestamp { time: 1_700_000_000, increment: 42 };
        assert_eq!(OplogTimestamp::from_packed(ts.packed()), ts);
    }

    #[test]
    fn test_wall_clock_fallback_truncates_to_seconds() {
        let ts = OplogTimestamp::from_wall_clock_ms(1_700_000_000_999);
        assert_eq!(ts.time, 1_700_000_000);
        assert_eq!(ts.increment, 0);
    }

    #[test]
    fn test_slice_query_is_extended_json() {
        let ts = OplogTimestamp { time: 100, increment: 7 };
        assert_eq!(
            ts.slice_query(),
            r#"{ "ts": { "$gt": { "$timestamp": { "t": 100, "i": 7 } } } }"#
        );
    }

    #[test]
    fn test_plain_insert_planned() {
        let planned = plan_entry(&insert_entry("app.users", 1));
        assert_eq!(planned.len(), 1);
        match &planned[0] {
            PlannedOp::Apply(OplogAction::Insert { db, coll, document }) => {
                assert_eq!(db, "app");
                assert_eq!(coll, "users");
                assert_eq!(document.get_i32("_id").unwrap(), 1);
            }
            other => panic!("unexpected plan: {:?}", other),
        }
    }

    #[test]
    fn test_collection_names_with_dots_keep_full_name() {
        let planned = plan_entry(&insert_entry("app.users.archive", 1));
        match &planned[0] {
            PlannedOp::Apply(OplogAction::Insert { db, coll, .. }) => {
                assert_eq!(db, "app");
                assert_eq!(coll, "users.archive");
            }
            other => panic!("unexpected plan: {:?}", other),
        }
    }

    #[test]
    fn test_noop_and_system_namespaces_skipped() {
        let noop = doc! { "op": "n", "ns": "app.users", "o": {} };
        assert_eq!(plan_entry(&noop), vec![PlannedOp::Skip(SkipReason::Noop)]);

        for ns in ["config.transactions", "local.oplog.rs", "admin.system.users"] {
            let planned = plan_entry(&insert_entry(ns, 1));
            assert_eq!(planned, vec![PlannedOp::Skip(SkipReason::SystemNamespace)]);
        }
    }

    #[test]
    fn test_operator_update_vs_replace() {
        let operator = doc! {
            "op": "u", "ns": "app.users",
            "o": { "$set": { "name": "b" } },
            "o2": { "_id": 5 }
        };
        match &plan_entry(&operator)[0] {
            PlannedOp::Apply(OplogAction::UpdateOperators { id, update, .. }) => {
                assert_eq!(id, &Bson::Int32(5));
                assert!(update.contains_key("$set"));
            }
            other => panic!("unexpected plan: {:?}", other),
        }

        let replace = doc! {
            "op": "u", "ns": "app.users",
            "o": { "_id": 5, "name": "b" },
            "o2": { "_id": 5 }
        };
        assert!(matches!(
            &plan_entry(&replace)[0],
            PlannedOp::Apply(OplogAction::ReplaceUpsert { .. })
        ));
    }

    #[test]
    fn test_diff_format_update_skipped() {
        let entry = doc! {
            "op": "u", "ns": "app.users",
            "o": { "$v": 2, "diff": { "u": { "name": "b" } } },
            "o2": { "_id": 5 }
        };
        assert_eq!(
            plan_entry(&entry),
            vec![PlannedOp::Skip(SkipReason::UnsupportedDiffUpdate)]
        );
    }

    #[test]
    fn test_update_without_target_id_skipped() {
        let entry = doc! { "op": "u", "ns": "app.users", "o": { "$set": { "a": 1 } } };
        assert_eq!(
            plan_entry(&entry),
            vec![PlannedOp::Skip(SkipReason::MissingTargetId)]
        );
    }

    #[test]
    fn test_plain_delete_applied() {
        let entry = doc! { "op": "d", "ns": "app.users", "o": { "_id": 9 } };
        assert!(matches!(
            &plan_entry(&entry)[0],
            PlannedOp::Apply(OplogAction::Delete { .. })
        ));
    }

    #[test]
    fn test_apply_ops_unpacked_with_deletes_suppressed() {
        let entry = doc! {
            "op": "c", "ns": "admin.$cmd",
            "o": { "applyOps": [
                { "op": "i", "ns": "app.users", "o": { "_id": 1 } },
                { "op": "d", "ns": "app.users", "o": { "_id": 2 } },
                { "op": "u", "ns": "app.users", "o": { "_id": 3, "x": 1 }, "o2": { "_id": 3 } },
            ] }
        };
        let planned = plan_entry(&entry);
        assert_eq!(planned.len(), 3);
        assert!(matches!(&planned[0], PlannedOp::Apply(OplogAction::Insert { .. })));
        assert_eq!(planned[1], PlannedOp::Skip(SkipReason::SuppressedDelete));
        assert!(matches!(&planned[2], PlannedOp::Apply(OplogAction::ReplaceUpsert { .. })));
    }

    #[test]
    fn test_create_collection_applied_destructive_commands_skipped() {
        let create = doc! { "op": "c", "ns": "app.$cmd", "o": { "create": "users" } };
        match &plan_entry(&create)[0] {
            PlannedOp::Apply(OplogAction::CreateCollection { db, name }) => {
                assert_eq!(db, "app");
                assert_eq!(name, "users");
            }
            other => panic!("unexpected plan: {:?}", other),
        }

        for cmd in [
            doc! { "drop": "users" },
            doc! { "dropDatabase": 1 },
            doc! { "createIndexes": "users", "indexes": [] },
        ] {
            let entry = doc! { "op": "c", "ns": "app.$cmd", "o": cmd };
            assert_eq!(
                plan_entry(&entry),
                vec![PlannedOp::Skip(SkipReason::DestructiveCommand)]
            );
        }
    }

    #[test]
    fn test_unknown_command_and_missing_ns_skipped() {
        let unknown = doc! { "op": "c", "ns": "app.$cmd", "o": { "collMod": "users" } };
        assert_eq!(
            plan_entry(&unknown),
            vec![PlannedOp::Skip(SkipReason::UnsupportedCommand)]
        );

        let missing_ns = doc! { "op": "i", "o": { "_id": 1 } };
        assert_eq!(
            plan_entry(&missing_ns),
            vec![PlannedOp::Skip(SkipReason::MissingNamespace)]
        );
    }

    #[test]
    fn test_insert_batch_plans_every_entry() {
        // 5 inserts; whether 2 of them later hit duplicate keys is the
        // executor's concern, the plan itself carries all 5.
        let planned: Vec<PlannedOp> = (0..5)
            .flat_map(|i| plan_entry(&insert_entry("app.users", i)))
            .collect();
        assert_eq!(planned.len(), 5);
        assert!(planned
            .iter()
            .all(|p| matches!(p, PlannedOp::Apply(OplogAction::Insert { .. }))));
    }
}
