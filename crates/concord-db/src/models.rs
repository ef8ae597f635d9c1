use concord_types::{Record, RecordId};

/// One row of the `records` table. The payload is the record's JSON.
pub struct RecordRow {
    pub id: String,
    pub thread_id: String,
    pub kind: String,
    pub created_at: i64,
    pub payload: String,
    pub consumed: bool,
}

/// What applying a transition changed in this store.
#[derive(Debug, Default, Clone)]
pub struct Applied {
    /// Outputs visible to this party that were newly stored.
    pub produced: Vec<Record>,
    /// Local records that this application consumed.
    pub consumed: Vec<RecordId>,
    /// The transition had already been applied here.
    pub duplicate: bool,
}
