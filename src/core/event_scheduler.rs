use super::event::SimEvent;
use super::types::SimTime;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

#[derive(Debug)]
pub struct ScheduledEvent {
    pub time: SimTime,
    pub sequence_num: u64,
    pub event: SimEvent,
}

impl PartialEq for ScheduledEvent {
    fn eq(&self, other: &Self) -> bool {
        self.time.total_cmp(&other.time) == Ordering::Equal && self.sequence_num == other.sequence_num
    }
}

impl Eq for ScheduledEvent {}

impl PartialOrd for ScheduledEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap (BinaryHeap is max-heap by default)
        other
            .time
            .total_cmp(&self.time)
            .then_with(|| other.sequence_num.cmp(&self.sequence_num))
    }
}

/// Future event list ordered by (time, insertion sequence)
#[derive(Debug, Default)]
pub struct EventScheduler {
    event_queue: BinaryHeap<ScheduledEvent>,
    sequence_counter: u64,
}

impl EventScheduler {
    pub fn new() -> Self {
        Self {
            event_queue: BinaryHeap::new(),
            sequence_counter: 0,
        }
    }

    /// Schedule an event at an absolute time
    pub fn schedule(&mut self, event: SimEvent, at_time: SimTime) {
        let scheduled_event = ScheduledEvent {
            time: at_time,
            sequence_num: self.sequence_counter,
            event,
        };

        self.event_queue.push(scheduled_event);
        self.sequence_counter += 1;
    }

    /// Pop the next event
    pub fn advance(&mut self) -> Option<ScheduledEvent> {
        self.event_queue.pop()
    }

    /// Pop every event sharing the earliest timestamp, in insertion order
    pub fn get_next_time_events(&mut self) -> Vec<ScheduledEvent> {
        let mut events = Vec::new();

        if let Some(next_time) = self.peek_time() {
            while self
                .event_queue
                .peek()
                .map_or(false, |scheduled| scheduled.time.total_cmp(&next_time) == Ordering::Equal)
            {
                if let Some(scheduled) = self.event_queue.pop() {
                    events.push(scheduled);
                }
            }
        }

        events
    }

    pub fn has_events(&self) -> bool {
        !self.event_queue.is_empty()
    }

    pub fn peek_time(&self) -> Option<SimTime> {
        self.event_queue.peek().map(|event| event.time)
    }

    pub fn len(&self) -> usize {
        self.event_queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.event_queue.is_empty()
    }
}
