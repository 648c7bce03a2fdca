//! Partitioning of batches into single-log-type sub-batches.
//!
//! The data collector API files every record of a request under the one
//! `Log-Type` header, so a request body must never mix event kinds.

use uuid::Uuid;

use crate::buffer::Batch;
use crate::metadata::Event;

/// Events of one log type from a single batch, in their original order.
/// Never empty.
#[derive(Debug, Clone)]
pub struct SubBatch {
    /// Id of the batch this was split from
    pub batch_id: Uuid,

    log_type: String,
    events: Vec<Event>,
}

impl SubBatch {
    pub fn log_type(&self) -> &str {
        &self.log_type
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Always `false`; provided for symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Serialize the events as the JSON array request body.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.events)
    }
}

/// Split a batch by log type.
///
/// Sub-batches come out in order of each type's first appearance in the
/// batch; within a sub-batch the events keep their relative order.
pub fn group_by_type(batch: Batch) -> Vec<SubBatch> {
    let batch_id = batch.batch_id;
    let mut groups: Vec<SubBatch> = Vec::new();

    for event in batch.into_events() {
        match groups.iter_mut().find(|g| g.log_type == event.log_type()) {
            Some(group) => group.events.push(event),
            None => groups.push(SubBatch {
                batch_id,
                log_type: event.log_type().to_string(),
                events: vec![event],
            }),
        }
    }

    groups
}
