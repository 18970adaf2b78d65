//! Ordered change feed with a replay cache.
//!
//! Every committed change gets a cursor. Subscribers may start from a cursor
//! still held in the cache and then follow live events without a gap.

use std::collections::VecDeque;

use concord_core::{
    ConflictId, ConflictStatus, OpId, Operation, Outcome, RecordId, Relationship, VectorSummary,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

use crate::config::FeedConfig;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    #[error("cursor {requested} is no longer retained (oldest is {oldest})")]
    CursorExpired { requested: u64, oldest: u64 },

    #[error("subscriber fell behind and missed {skipped} events")]
    Lagged { skipped: u64 },

    #[error("change feed closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Change {
    FieldApplied {
        operation: Operation,
    },
    RelationshipChanged {
        relationship: Relationship,
    },
    VectorUpdated {
        summary: VectorSummary,
    },
    VectorStale {
        content_hash: String,
    },
    ConflictDetected {
        conflict_id: ConflictId,
        status: ConflictStatus,
    },
    ConflictResolved {
        outcome: Outcome,
    },
    /// A buffered operation was dropped after waiting too long.
    OperationExpired {
        operation_id: OpId,
        waited_ms: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub cursor: u64,
    pub record_id: Option<RecordId>,
    pub change: Change,
}

impl ChangeEvent {
    /// Relationship events concern both endpoints.
    pub fn concerns(&self, record_id: RecordId) -> bool {
        if self.record_id == Some(record_id) {
            return true;
        }
        match &self.change {
            Change::RelationshipChanged { relationship } => {
                relationship.key.source_id == record_id || relationship.key.target_id == record_id
            }
            _ => false,
        }
    }
}

struct FeedState {
    backlog: VecDeque<ChangeEvent>,
    next_cursor: u64,
    sender: Option<broadcast::Sender<ChangeEvent>>,
}

pub struct ChangeFeed {
    state: Mutex<FeedState>,
    retention: usize,
}

impl ChangeFeed {
    pub fn new(config: &FeedConfig) -> Self {
        let (sender, _) = broadcast::channel(config.channel_capacity.max(1));
        Self {
            state: Mutex::new(FeedState {
                backlog: VecDeque::new(),
                next_cursor: 1,
                sender: Some(sender),
            }),
            retention: config.retention,
        }
    }

    /// Append a change and return its cursor.
    pub fn publish(&self, record_id: Option<RecordId>, change: Change) -> u64 {
        let mut state = self.state.lock();
        let cursor = state.next_cursor;
        state.next_cursor += 1;
        let event = ChangeEvent {
            cursor,
            record_id,
            change,
        };
        if self.retention > 0 {
            if state.backlog.len() == self.retention {
                state.backlog.pop_front();
            }
            state.backlog.push_back(event.clone());
        }
        if let Some(sender) = &state.sender {
            // No receivers is fine; the backlog still has it.
            let _ = sender.send(event);
        }
        cursor
    }

    /// Cursor the next published change will get.
    pub fn head(&self) -> u64 {
        self.state.lock().next_cursor
    }

    /// Follow changes starting at `from` (inclusive), or only new ones when
    /// `from` is `None`. `filter` keeps events concerning one record.
    pub fn subscribe(
        &self,
        from: Option<u64>,
        filter: Option<RecordId>,
    ) -> Result<ChangeSubscription, FeedError> {
        let state = self.state.lock();
        let sender = state.sender.as_ref().ok_or(FeedError::Closed)?;
        let start = from.unwrap_or(state.next_cursor);
        let oldest = state
            .backlog
            .front()
            .map_or(state.next_cursor, |e| e.cursor);
        if start < oldest {
            return Err(FeedError::CursorExpired {
                requested: start,
                oldest,
            });
        }
        let replay = state
            .backlog
            .iter()
            .filter(|e| e.cursor >= start)
            .cloned()
            .collect();
        debug!(start, ?filter, "change feed subscription");
        Ok(ChangeSubscription {
            replay,
            receiver: sender.subscribe(),
            next: start,
            filter,
        })
    }

    /// Live subscribers see the end of the stream once they drain.
    pub fn close(&self) {
        self.state.lock().sender = None;
    }
}

pub struct ChangeSubscription {
    replay: VecDeque<ChangeEvent>,
    receiver: broadcast::Receiver<ChangeEvent>,
    next: u64,
    filter: Option<RecordId>,
}

impl ChangeSubscription {
    /// Next matching event; `None` once the feed is closed and drained.
    pub async fn next(&mut self) -> Option<Result<ChangeEvent, FeedError>> {
        loop {
            let event = match self.replay.pop_front() {
                Some(event) => event,
                None => match self.receiver.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        return Some(Err(FeedError::Lagged { skipped }));
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
            };
            if event.cursor < self.next {
                continue;
            }
            self.next = event.cursor + 1;
            if self.filter.is_none_or(|id| event.concerns(id)) {
                return Some(Ok(event));
            }
        }
    }

    /// Cursor to resume from after a disconnect.
    pub fn resume_cursor(&self) -> u64 {
        self.next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(retention: usize) -> ChangeFeed {
        ChangeFeed::new(&FeedConfig {
            retention,
            channel_capacity: 16,
        })
    }

    fn stale(hash: &str) -> Change {
        Change::VectorStale {
            content_hash: hash.into(),
        }
    }

    #[tokio::test]
    async fn replay_then_live_without_gaps() -> Result<(), Box<dyn std::error::Error>> {
        let feed = feed(8);
        let record = RecordId::new();
        feed.publish(Some(record), stale("a"));
        feed.publish(Some(record), stale("b"));

        let mut sub = feed.subscribe(Some(2), None)?;
        feed.publish(Some(record), stale("c"));

        let second = sub.next().await.ok_or("ended")??;
        let third = sub.next().await.ok_or("ended")??;
        assert_eq!((second.cursor, third.cursor), (2, 3));
        assert_eq!(sub.resume_cursor(), 4);
        Ok(())
    }

    #[tokio::test]
    async fn filter_keeps_one_record() -> Result<(), Box<dyn std::error::Error>> {
        let feed = feed(8);
        let (mine, other) = (RecordId::new(), RecordId::new());
        feed.publish(Some(other), stale("x"));
        feed.publish(Some(mine), stale("y"));

        let mut sub = feed.subscribe(Some(1), Some(mine))?;
        let event = sub.next().await.ok_or("ended")??;
        assert_eq!(event.record_id, Some(mine));
        assert_eq!(event.cursor, 2);
        Ok(())
    }

    #[test]
    fn evicted_cursor_is_refused() {
        let feed = feed(2);
        for hash in ["a", "b", "c"] {
            feed.publish(None, stale(hash));
        }
        assert!(matches!(
            feed.subscribe(Some(1), None),
            Err(FeedError::CursorExpired {
                requested: 1,
                oldest: 2
            })
        ));
        assert!(feed.subscribe(Some(2), None).is_ok());
    }

    #[tokio::test]
    async fn close_ends_stream() -> Result<(), Box<dyn std::error::Error>> {
        let feed = feed(4);
        let mut sub = feed.subscribe(None, None)?;
        feed.publish(None, stale("a"));
        feed.close();
        assert!(sub.next().await.is_some());
        assert!(sub.next().await.is_none());
        assert_eq!(feed.subscribe(None, None).err(), Some(FeedError::Closed));
        Ok(())
    }
}
