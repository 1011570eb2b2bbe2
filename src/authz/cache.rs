use super::decision::{AccessDecision, Action, CachedDecision};
use std::collections::HashMap;

/// Per-session memo of definitive topic decisions, one map per action.
///
/// Absence means "never checked". Indeterminate outcomes are never stored, so a
/// transient remote failure cannot turn into a permanent grant or denial.
#[derive(Debug)]
pub struct TopicAccessCache {
    subscribe: HashMap<String, CachedDecision>,
    publish: HashMap<String, CachedDecision>,
    capacity: usize,
}

/// What `record` did with a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Stored,
    SkippedIndeterminate,
    SkippedFull,
}

impl TopicAccessCache {
    /// `capacity` bounds the number of topics per action.
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribe: HashMap::new(),
            publish: HashMap::new(),
            capacity,
        }
    }

    pub fn lookup(&self, action: Action, topic: &str) -> Option<CachedDecision> {
        self.decisions(action).get(topic).copied()
    }

    pub fn record(&mut self, action: Action, topic: &str, decision: &AccessDecision) -> RecordOutcome {
        let Some(cached) = decision.cacheable() else {
            return RecordOutcome::SkippedIndeterminate;
        };
        let capacity = self.capacity;
        let map = self.decisions_mut(action);
        if let Some(existing) = map.get_mut(topic) {
            *existing = cached;
            return RecordOutcome::Stored;
        }
        if map.len() >= capacity {
            return RecordOutcome::SkippedFull;
        }
        map.insert(topic.to_string(), cached);
        RecordOutcome::Stored
    }

    pub fn len(&self, action: Action) -> usize {
        self.decisions(action).len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribe.is_empty() && self.publish.is_empty()
    }

    fn decisions(&self, action: Action) -> &HashMap<String, CachedDecision> {
        match action {
            Action::Subscribe => &self.subscribe,
            Action::Publish => &self.publish,
        }
    }

    fn decisions_mut(&mut self, action: Action) -> &mut HashMap<String, CachedDecision> {
        match action {
            Action::Subscribe => &mut self.subscribe,
            Action::Publish => &mut self.publish,
        }
    }
}
