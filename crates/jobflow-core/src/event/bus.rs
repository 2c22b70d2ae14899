//! Broadcast bus for run lifecycle events.
//!
//! Publishing never blocks the engine and is a no-op with nobody listening.
//! Subscribers can follow every run or a single one; a subscriber that falls
//! more than the buffer behind is told how many events it missed.

use jobflow_types::event::WorkflowEvent;
use tokio::sync::broadcast::{self, error::RecvError};
use uuid::Uuid;

/// Multi-producer, multi-consumer bus for `WorkflowEvent`s.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    /// A bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Follow events of every run published from now on.
    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            rx: self.sender.subscribe(),
            run_id: None,
        }
    }

    /// Follow only the events of `run_id`.
    pub fn subscribe_run(&self, run_id: Uuid) -> EventSubscription {
        EventSubscription {
            rx: self.sender.subscribe(),
            run_id: Some(run_id),
        }
    }

    /// Subscribe to all runs, or to one when `run_id` is given.
    pub fn subscribe_filtered(&self, run_id: Option<Uuid>) -> EventSubscription {
        match run_id {
            Some(id) => self.subscribe_run(id),
            None => self.subscribe(),
        }
    }

    pub fn publish(&self, event: WorkflowEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

/// One item handed to a subscriber.
#[derive(Debug, Clone)]
pub enum Received {
    Event(WorkflowEvent),
    /// This many events were dropped before the subscriber caught up.
    /// Missed events are not filtered, so the count may include other runs.
    Lagged(u64),
}

/// A receiver on the bus, optionally narrowed to a single run.
#[derive(Debug)]
pub struct EventSubscription {
    rx: broadcast::Receiver<WorkflowEvent>,
    run_id: Option<Uuid>,
}

impl EventSubscription {
    /// The next matching item, or `None` once every bus handle is gone.
    pub async fn next(&mut self) -> Option<Received> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.matches(&event) => return Some(Received::Event(event)),
                Ok(_) => continue,
                Err(RecvError::Lagged(missed)) => return Some(Received::Lagged(missed)),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Wait for the run's terminal event, handing earlier events to
    /// `on_event`. Returns the terminal event, or `None` if the bus closed
    /// first.
    pub async fn until_terminal(
        &mut self,
        mut on_event: impl FnMut(&WorkflowEvent),
    ) -> Option<WorkflowEvent> {
        while let Some(item) = self.next().await {
            if let Received::Event(event) = item {
                on_event(&event);
                if event.is_terminal() {
                    return Some(event);
                }
            }
        }
        None
    }

    fn matches(&self, event: &WorkflowEvent) -> bool {
        self.run_id.is_none_or(|id| id == event.run_id())
    }
}
