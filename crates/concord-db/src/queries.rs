use std::collections::BTreeSet;

use anyhow::{Result, anyhow};
use rusqlite::Connection;
use tracing::debug;
use uuid::Uuid;

use concord_types::{Party, Record, RecordId, RecordKind, StoredRecord, ThreadId, Transition};

use crate::Database;
use crate::models::{Applied, RecordRow};

const RECORD_COLUMNS: &str = "id, thread_id, kind, created_at, payload, consumed";

impl Database {
    // -- Records --

    /// Store a record unless its id (or, for messages, a live copy of the same
    /// logical message) already exists. Returns whether a row was written.
    pub fn insert_record(&self, record: &Record) -> Result<bool> {
        self.with_conn_mut(|conn| insert_row(conn, record))
    }

    /// Look a record up by id, live or consumed. The flag is `true` when consumed.
    pub fn get_record(&self, id: RecordId) -> Result<Option<(Record, bool)>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM records WHERE id = ?1", RECORD_COLUMNS);
            let row = conn.query_row(&sql, [id.to_string()], map_row).optional()?;
            row.map(|row| {
                let consumed = row.consumed;
                decode(row).map(|record| (record, consumed))
            })
            .transpose()
        })
    }

    /// All records of one kind for a thread, oldest first.
    pub fn query_by_thread_id(
        &self,
        thread_id: ThreadId,
        kind: RecordKind,
        include_consumed: bool,
    ) -> Result<Vec<Record>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM records
                 WHERE thread_id = ?1 AND kind = ?2 AND (?3 = 1 OR consumed = 0)
                 ORDER BY created_at ASC, id ASC",
                RECORD_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(
                    rusqlite::params![thread_id.to_string(), kind.as_str(), include_consumed],
                    map_row,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.into_iter().map(decode).collect()
        })
    }

    /// Typed variant of [`query_by_thread_id`](Self::query_by_thread_id).
    pub fn records<T: StoredRecord>(&self, thread_id: ThreadId, include_consumed: bool) -> Result<Vec<T>> {
        Ok(self
            .query_by_thread_id(thread_id, T::KIND, include_consumed)?
            .into_iter()
            .filter_map(T::from_record)
            .collect())
    }

    /// The two newest live records of one kind for a thread, newest first.
    /// Two are enough to tell whether the head is ambiguous.
    pub fn head_candidates(&self, thread_id: ThreadId, kind: RecordKind) -> Result<Vec<Record>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM records
                 WHERE thread_id = ?1 AND kind = ?2 AND consumed = 0
                 ORDER BY created_at DESC, id DESC
                 LIMIT 2",
                RECORD_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params![thread_id.to_string(), kind.as_str()], map_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.into_iter().map(decode).collect()
        })
    }

    /// Every thread with at least one live record in this store.
    pub fn query_all_thread_ids(&self) -> Result<BTreeSet<ThreadId>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT DISTINCT thread_id FROM records WHERE consumed = 0")?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            ids.into_iter()
                .map(|id| id.parse().map_err(|e| anyhow!("Corrupt thread_id '{}': {}", id, e)))
                .collect()
        })
    }

    pub fn has_live_message(&self, message_id: Uuid) -> Result<bool> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM records WHERE message_id = ?1 AND consumed = 0",
                [message_id.to_string()],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    // -- Transitions --

    /// Record a committed transition: consume the inputs this store holds and
    /// store the outputs visible to `party`. All or nothing. Applying the same
    /// transition twice is a no-op.
    pub fn apply_transition(&self, transition: &Transition, party: &Party) -> Result<Applied> {
        self.with_conn_mut(|conn| {
            let tid = transition.id.to_string();
            if transition_applied(conn, &tid)? {
                debug!("Transition {} already applied for {}", tid, party);
                return Ok(Applied {
                    duplicate: true,
                    ..Applied::default()
                });
            }

            let mut applied = Applied::default();
            for input in &transition.inputs {
                let changed = conn.execute(
                    "UPDATE records SET consumed = 1, consumed_by = ?2 WHERE id = ?1 AND consumed = 0",
                    rusqlite::params![input.to_string(), tid],
                )?;
                if changed == 1 {
                    applied.consumed.push(*input);
                } else if !record_exists(conn, &input.to_string())? {
                    conn.execute(
                        "INSERT OR IGNORE INTO early_consumptions (record_id, consumed_by) VALUES (?1, ?2)",
                        rusqlite::params![input.to_string(), tid],
                    )?;
                }
            }

            for output in transition.outputs.iter().filter(|o| o.is_visible_to(party)) {
                if insert_row(conn, output)? {
                    applied.produced.push(output.clone());
                }
            }

            conn.execute(
                "INSERT INTO transitions (id, thread_id, command) VALUES (?1, ?2, ?3)",
                rusqlite::params![tid, transition.thread_id.to_string(), transition.command.name()],
            )?;

            Ok(applied)
        })
    }

    /// Consume every live record of a thread in this store only. Used when a
    /// thread ends for this party outside of a shared commit.
    pub fn tombstone_thread(&self, thread_id: ThreadId) -> Result<Vec<RecordId>> {
        self.with_conn_mut(|conn| {
            let mut stmt = conn.prepare("SELECT id FROM records WHERE thread_id = ?1 AND consumed = 0")?;
            let ids = stmt
                .query_map([thread_id.to_string()], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            conn.execute(
                "UPDATE records SET consumed = 1, consumed_by = 'tombstone' WHERE thread_id = ?1 AND consumed = 0",
                [thread_id.to_string()],
            )?;

            ids.into_iter()
                .map(|id| id.parse().map_err(|e| anyhow!("Corrupt record id '{}': {}", id, e)))
                .collect()
        })
    }
}

fn insert_row(conn: &Connection, record: &Record) -> Result<bool> {
    let id = record.id().to_string();
    let payload = serde_json::to_string(record)?;
    let message_id = match record {
        Record::Message(m) => Some(m.message_id.to_string()),
        _ => None,
    };

    let consumed_by: Option<String> = conn
        .query_row(
            "SELECT consumed_by FROM early_consumptions WHERE record_id = ?1",
            [&id],
            |row| row.get(0),
        )
        .optional()?;

    let changed = conn.execute(
        "INSERT OR IGNORE INTO records (id, thread_id, kind, created_at, message_id, payload, consumed, consumed_by)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        rusqlite::params![
            id,
            record.thread_id().to_string(),
            record.kind().as_str(),
            record.created_at().timestamp_micros(),
            message_id,
            payload,
            consumed_by.is_some(),
            consumed_by,
        ],
    )?;

    if consumed_by.is_some() {
        debug!("Record {} arrived after the transition that consumed it", id);
        conn.execute("DELETE FROM early_consumptions WHERE record_id = ?1", [&id])?;
        return Ok(false);
    }
    Ok(changed == 1)
}

fn record_exists(conn: &Connection, id: &str) -> Result<bool> {
    let found: Option<String> = conn
        .query_row("SELECT id FROM records WHERE id = ?1", [id], |row| row.get(0))
        .optional()?;
    Ok(found.is_some())
}

fn transition_applied(conn: &Connection, id: &str) -> Result<bool> {
    let found: Option<String> = conn
        .query_row("SELECT id FROM transitions WHERE id = ?1", [id], |row| row.get(0))
        .optional()?;
    Ok(found.is_some())
}

fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RecordRow> {
    Ok(RecordRow {
        id: row.get(0)?,
        thread_id: row.get(1)?,
        kind: row.get(2)?,
        created_at: row.get(3)?,
        payload: row.get(4)?,
        consumed: row.get(5)?,
    })
}

fn decode(row: RecordRow) -> Result<Record> {
    let record: Record = serde_json::from_str(&row.payload)
        .map_err(|e| anyhow!("Corrupt {} record '{}' in thread '{}': {}", row.kind, row.id, row.thread_id, e))?;
    if record.created_at().timestamp_micros() != row.created_at {
        return Err(anyhow!("Record '{}' timestamp does not match its payload", row.id));
    }
    Ok(record)
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use concord_types::{Command, MessageRecord, ThreadMetaRecord};

    fn party(name: &str) -> Party {
        Party::from(name)
    }

    fn meta(thread_id: ThreadId) -> ThreadMetaRecord {
        ThreadMetaRecord::new(thread_id, party("x"), BTreeSet::from([party("y")]))
    }

    fn message(thread_id: ThreadId, to: &str) -> MessageRecord {
        MessageRecord {
            id: RecordId::new(),
            message_id: Uuid::new_v4(),
            thread_id,
            created_at: Utc::now(),
            subject: "hello".into(),
            sender: party("x"),
            content: "first".into(),
            attachment: None,
            visible_to: party(to),
        }
    }

    #[test]
    fn apply_stores_only_visible_outputs() {
        let db = Database::open_in_memory().unwrap();
        let thread_id = ThreadId::new();
        let m = meta(thread_id);
        let for_x = message(thread_id, "x");
        let for_y = for_x.copy_for(&party("y"));
        let t = Transition::new(thread_id, Command::CreateThread, m.roster())
            .producing([m.clone().into(), for_x.clone().into(), for_y.into()]);

        let applied = db.apply_transition(&t, &party("x")).unwrap();
        assert_eq!(applied.produced.len(), 2);
        assert!(applied.consumed.is_empty());

        let messages: Vec<MessageRecord> = db.records(thread_id, false).unwrap();
        assert_eq!(messages, vec![for_x]);
    }

    #[test]
    fn apply_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let thread_id = ThreadId::new();
        let m = meta(thread_id);
        let t = Transition::new(thread_id, Command::CreateThread, m.roster()).producing([m.into()]);

        assert!(!db.apply_transition(&t, &party("x")).unwrap().duplicate);
        let again = db.apply_transition(&t, &party("x")).unwrap();
        assert!(again.duplicate);
        assert!(again.produced.is_empty() && again.consumed.is_empty());
    }

    #[test]
    fn consumed_records_leave_the_head() {
        let db = Database::open_in_memory().unwrap();
        let thread_id = ThreadId::new();
        let first = meta(thread_id);
        db.insert_record(&first.clone().into()).unwrap();

        let second = first.successor(BTreeSet::from([party("y"), party("z")]));
        let t = Transition::new(thread_id, Command::FinalizeParticipants, first.roster())
            .consuming([first.id])
            .producing([second.clone().into()]);
        let applied = db.apply_transition(&t, &party("x")).unwrap();
        assert_eq!(applied.consumed, vec![first.id]);

        let heads = db.head_candidates(thread_id, RecordKind::Meta).unwrap();
        assert_eq!(heads, vec![Record::Meta(second)]);

        let all: Vec<ThreadMetaRecord> = db.records(thread_id, true).unwrap();
        assert_eq!(all.len(), 2);
        let (_, consumed) = db.get_record(first.id).unwrap().unwrap();
        assert!(consumed);
    }

    #[test]
    fn head_candidates_are_newest_first() {
        let db = Database::open_in_memory().unwrap();
        let thread_id = ThreadId::new();
        let mut older = message(thread_id, "x");
        older.created_at = Utc::now() - Duration::seconds(10);
        let newer = message(thread_id, "x");
        let oldest = MessageRecord {
            created_at: Utc::now() - Duration::seconds(20),
            ..message(thread_id, "x")
        };
        for m in [&older, &newer, &oldest] {
            db.insert_record(&m.clone().into()).unwrap();
        }

        let heads = db.head_candidates(thread_id, RecordKind::Message).unwrap();
        assert_eq!(heads.len(), 2);
        assert_eq!(heads[0].id(), newer.id);
        assert_eq!(heads[1].id(), older.id);
    }

    #[test]
    fn consumption_before_arrival_is_remembered() {
        let db = Database::open_in_memory().unwrap();
        let thread_id = ThreadId::new();
        let m = meta(thread_id);
        let successor = m.successor(BTreeSet::from([party("y"), party("z")]));

        let consume = Transition::new(thread_id, Command::FinalizeParticipants, m.roster())
            .consuming([m.id])
            .producing([successor.clone().into()]);
        let create = Transition::new(thread_id, Command::CreateThread, m.roster()).producing([m.clone().into()]);

        // Delivered out of order
        db.apply_transition(&consume, &party("x")).unwrap();
        let late = db.apply_transition(&create, &party("x")).unwrap();
        assert!(late.produced.is_empty());

        let heads = db.head_candidates(thread_id, RecordKind::Meta).unwrap();
        assert_eq!(heads, vec![Record::Meta(successor)]);
    }

    #[test]
    fn one_live_copy_per_message() {
        let db = Database::open_in_memory().unwrap();
        let thread_id = ThreadId::new();
        let m = message(thread_id, "z");
        assert!(db.insert_record(&m.clone().into()).unwrap());
        // Same logical message, different copy id
        assert!(!db.insert_record(&m.copy_for(&party("z")).into()).unwrap());
        assert!(db.has_live_message(m.message_id).unwrap());
    }

    #[test]
    fn tombstone_consumes_everything_for_the_thread() {
        let db = Database::open_in_memory().unwrap();
        let thread_id = ThreadId::new();
        let other = ThreadId::new();
        db.insert_record(&meta(thread_id).into()).unwrap();
        db.insert_record(&message(thread_id, "x").into()).unwrap();
        db.insert_record(&meta(other).into()).unwrap();

        let gone = db.tombstone_thread(thread_id).unwrap();
        assert_eq!(gone.len(), 2);
        assert_eq!(db.query_all_thread_ids().unwrap(), BTreeSet::from([other]));
        assert!(db.head_candidates(thread_id, RecordKind::Meta).unwrap().is_empty());
    }
}
