use std::sync::Arc;

use serde::ser::{Serialize, SerializeStruct, Serializer};
use serde_json::Value;

use crate::protocol::canonical::Message;

/// Generates revision ids that are unique within one emitter.
pub(crate) struct RevisionIdGenerator {
    seed: u128,
    counter: u64,
}

impl RevisionIdGenerator {
    #[must_use]
    pub(crate) fn new() -> Self {
        let seed_hi = u128::from(fastrand::u64(..));
        let seed_lo = u128::from(fastrand::u64(..));
        Self {
            seed: (seed_hi << 64) | seed_lo,
            counter: 0,
        }
    }

    pub(crate) fn next_revision(&mut self) -> uuid::Uuid {
        self.counter += 1;
        uuid::Uuid::from_u128(self.seed ^ u128::from(self.counter))
    }
}

/// Immutable view of the transcript at one point in the stream.
///
/// Archived messages and sidecar values are shared with later snapshots;
/// nothing reachable from a snapshot is ever mutated after emission.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub revision: uuid::Uuid,
    pub archived: Arc<[Arc<Message>]>,
    /// Copy of the in-progress message, stamped with `revision`.
    pub current: Option<Arc<Message>>,
    pub sidecar: Arc<[Value]>,
}

impl Snapshot {
    /// Archived messages followed by the in-progress one.
    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.archived
            .iter()
            .map(|message| &**message)
            .chain(self.current.as_deref())
    }

    #[must_use]
    pub fn message_count(&self) -> usize {
        self.archived.len() + usize::from(self.current.is_some())
    }

    #[must_use]
    pub fn last_message(&self) -> Option<&Message> {
        self.current
            .as_deref()
            .or_else(|| self.archived.last().map(|message| &**message))
    }
}

struct MessagesView<'a>(&'a Snapshot);

impl Serialize for MessagesView<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.0.messages())
    }
}

impl Serialize for Snapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Snapshot", 3)?;
        state.serialize_field("revision", &self.revision)?;
        state.serialize_field("messages", &MessagesView(self))?;
        state.serialize_field("sidecar", &*self.sidecar)?;
        state.end()
    }
}

/// Builds snapshots from assembler state.
///
/// Archived messages and sidecar values are append-only, so the shared copies
/// are rebuilt only when their length changes.
pub struct SnapshotEmitter {
    revisions: RevisionIdGenerator,
    archived_cache: Arc<[Arc<Message>]>,
    sidecar_cache: Arc<[Value]>,
    emitted: u64,
}

impl Default for SnapshotEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotEmitter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            revisions: RevisionIdGenerator::new(),
            archived_cache: Arc::from(Vec::new()),
            sidecar_cache: Arc::from(Vec::new()),
            emitted: 0,
        }
    }

    pub fn emit(
        &mut self,
        archived: &[Arc<Message>],
        current: Option<&Message>,
        sidecar: &[Value],
    ) -> Snapshot {
        if self.archived_cache.len() != archived.len() {
            self.archived_cache = archived.iter().cloned().collect();
        }
        if self.sidecar_cache.len() != sidecar.len() {
            self.sidecar_cache = Arc::from(sidecar);
        }

        let revision = self.revisions.next_revision();
        let current = current.map(|message| {
            let mut copy = message.clone();
            copy.revision = Some(revision);
            Arc::new(copy)
        });
        self.emitted += 1;

        Snapshot {
            revision,
            archived: Arc::clone(&self.archived_cache),
            current,
            sidecar: Arc::clone(&self.sidecar_cache),
        }
    }

    /// Number of snapshots emitted so far.
    #[must_use]
    pub fn emitted(&self) -> u64 {
        self.emitted
    }
}
