//! Virtual Queue set: the SQ/CQ pairs and shared bitmap/doorbell state that
//! make up one node's data plane (spec.md section 4.2).

pub mod common;
pub mod cq;
pub mod sq;

use std::sync::Arc;

use common::{Doorbell, VqCommon};
use cq::{Cq, EventSink, NullEventSink};
use sq::Sq;

use crate::error::{DriverError, Result};

/// All SQs and CQs belonging to one node, plus the bitmap/doorbell state they
/// share (spec.md section 4.3 step 6: counts and per-queue sizes come from
/// the DIR's VQ descriptor).
pub struct VqSet {
    pub common: Arc<VqCommon>,
    pub sqs: Vec<Sq>,
    pub cqs: Vec<Cq>,
}

impl VqSet {
    pub fn new(
        sq_count: usize,
        cq_count: usize,
        per_sq_size: usize,
        per_cq_size: usize,
        doorbell: Box<dyn Doorbell>,
    ) -> Self {
        Self::with_event_sink(
            sq_count,
            cq_count,
            per_sq_size,
            per_cq_size,
            doorbell,
            Box::new(NullEventSink),
        )
    }

    pub fn with_event_sink(
        sq_count: usize,
        cq_count: usize,
        per_sq_size: usize,
        per_cq_size: usize,
        doorbell: Box<dyn Doorbell>,
        event_sink: Box<dyn EventSink>,
    ) -> Self {
        let common = Arc::new(VqCommon::new(
            sq_count,
            cq_count,
            per_sq_size,
            per_cq_size,
            doorbell,
        ));
        let sqs = (0..sq_count)
            .map(|i| Sq::new(i, per_sq_size, common.clone()))
            .collect();

        // Only the first CQ carries the event sink; spec.md section 4.2
        // reserves device events for a designated completion queue.
        let mut event_sink = Some(event_sink);
        let cqs = (0..cq_count)
            .map(|i| match event_sink.take() {
                Some(sink) if i == 0 => Cq::with_event_sink(i, per_cq_size, common.clone(), sink),
                _ => Cq::new(i, per_cq_size, common.clone()),
            })
            .collect::<Vec<_>>();
        Self { common, sqs, cqs }
    }

    pub fn sq(&self, index: usize) -> Result<&Sq> {
        self.sqs
            .get(index)
            .ok_or_else(|| DriverError::InvalidArgument(format!("sq index {index} out of range")))
    }

    pub fn cq(&self, index: usize) -> Result<&Cq> {
        self.cqs
            .get(index)
            .ok_or_else(|| DriverError::InvalidArgument(format!("cq index {index} out of range")))
    }

    /// spec.md section 5 "teardown": abort every waiter and mark the set
    /// non-operational before a node-level reset takes the queues down.
    pub fn abort(&self) {
        self.common.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::NullDoorbell;

    #[test]
    fn sq_and_cq_push_pop_round_trip_through_a_set() {
        let set = VqSet::new(2, 2, 64, 64, Box::new(NullDoorbell));
        assert_eq!(set.sqs.len(), 2);
        assert_eq!(set.cqs.len(), 2);
        assert!(set.sq(5).is_err());
        assert!(set.cq(5).is_err());
    }

    #[test]
    fn abort_propagates_to_shared_common_state() {
        let set = VqSet::new(1, 1, 64, 64, Box::new(NullDoorbell));
        set.abort();
        assert!(set.common.is_aborting());
    }
}
