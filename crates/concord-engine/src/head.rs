//! Current-version lookup for versioned records.
//!
//! Thread meta is a singleton: exactly one live version per thread. Messages
//! accumulate, so their "head" is only the newest one and ties are harmless.

use std::ops::Deref;

use tracing::warn;

use concord_db::Database;
use concord_types::{StoredRecord, ThreadId};

use crate::error::{Error, Result};

/// The live, newest version of a record kind for one thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Head<T> {
    record: T,
}

impl<T> Head<T> {
    pub fn into_inner(self) -> T {
        self.record
    }
}

impl<T> Deref for Head<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.record
    }
}

/// Resolve the live record of kind `T` with the greatest `created_at`.
///
/// Fails with [`Error::NotFound`] when the store holds no live record of that
/// kind, and with [`Error::AmbiguousHead`] when a singleton kind has two live
/// records tied at the newest timestamp.
pub fn resolve_head<T: StoredRecord>(db: &Database, thread_id: ThreadId) -> Result<Head<T>> {
    let mut candidates = db
        .head_candidates(thread_id, T::KIND)?
        .into_iter()
        .filter_map(T::from_record);

    let Some(newest) = candidates.next() else {
        return Err(Error::NotFound {
            thread_id,
            kind: T::KIND.as_str(),
        });
    };

    if let Some(runner_up) = candidates.next() {
        if T::KIND.is_singleton() {
            if runner_up.created_at() == newest.created_at() {
                return Err(Error::AmbiguousHead {
                    thread_id,
                    kind: T::KIND.as_str(),
                });
            }
            warn!(
                "Thread {} holds more than one live {} record, using {}",
                thread_id,
                T::KIND.as_str(),
                newest.id()
            );
        }
    }

    Ok(Head { record: newest })
}
