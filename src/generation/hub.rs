use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;

use super::GeneratedCard;

const CHANNEL_CAPACITY: usize = 64;

/// An event on a job's SSE stream
///
/// `resume_token` is `"{job_id}:{index}"` where index is the last card index
/// the client has seen (-1 before the first card).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    Progress {
        progress: f64,
        step: String,
        resume_token: String,
    },
    Card {
        card: GeneratedCard,
        card_index: usize,
        progress: f64,
        resume_token: String,
    },
    Complete {
        progress: f64,
        message: String,
        total_cards: usize,
        resume_token: String,
    },
    Error {
        error: String,
        resume_token: String,
    },
}

impl JobEvent {
    /// SSE event name
    pub fn name(&self) -> &'static str {
        match self {
            JobEvent::Progress { .. } => "progress",
            JobEvent::Card { .. } => "card",
            JobEvent::Complete { .. } => "complete",
            JobEvent::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobEvent::Complete { .. } | JobEvent::Error { .. })
    }

    /// The token carried by this event, used as the SSE event id
    pub fn token(&self) -> &str {
        match self {
            JobEvent::Progress { resume_token, .. }
            | JobEvent::Card { resume_token, .. }
            | JobEvent::Complete { resume_token, .. }
            | JobEvent::Error { resume_token, .. } => resume_token,
        }
    }

    pub fn resume_token(job_id: &str, last_index: Option<usize>) -> String {
        match last_index {
            Some(index) => format!("{job_id}:{index}"),
            None => format!("{job_id}:-1"),
        }
    }
}

struct JobChannel {
    sender: broadcast::Sender<JobEvent>,
    /// Card events published so far, replayed to late subscribers
    cards: Vec<JobEvent>,
}

impl JobChannel {
    fn new() -> Self {
        Self {
            sender: broadcast::channel(CHANNEL_CAPACITY).0,
            cards: Vec::new(),
        }
    }
}

/// Per-job broadcast channels with the cards published so far
///
/// A job's entry lives from its first event until its terminal event, so a
/// client that connects mid-run still receives every card.
#[derive(Default)]
pub struct JobHub {
    channels: DashMap<String, JobChannel>,
}

impl std::fmt::Debug for JobHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHub").field("jobs", &self.channels.len()).finish()
    }
}

impl JobHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Card events published so far and a receiver for what follows
    ///
    /// Both are taken under the same entry lock, so no card is missed or
    /// seen twice between the snapshot and the live receiver.
    pub fn subscribe(&self, job_id: &str) -> (Vec<JobEvent>, broadcast::Receiver<JobEvent>) {
        let channel = self.channels.entry(job_id.to_string()).or_insert_with(JobChannel::new);
        (channel.cards.clone(), channel.sender.subscribe())
    }

    /// Index of the last card published for the job
    pub fn last_card_index(&self, job_id: &str) -> Option<usize> {
        self.channels
            .get(job_id)
            .and_then(|channel| channel.cards.len().checked_sub(1))
    }

    /// Resume token for the job's next event
    pub fn resume_token(&self, job_id: &str) -> String {
        JobEvent::resume_token(job_id, self.last_card_index(job_id))
    }

    /// Records the event and sends it to current subscribers
    ///
    /// A terminal event closes the job's entry.
    pub fn publish(&self, job_id: &str, event: JobEvent) {
        if event.is_terminal() {
            if let Some((_, channel)) = self.channels.remove(job_id) {
                let _ = channel.sender.send(event);
            }
            return;
        }

        let mut channel = self.channels.entry(job_id.to_string()).or_insert_with(JobChannel::new);
        if matches!(event, JobEvent::Card { .. }) {
            channel.cards.push(event.clone());
        }
        let _ = channel.sender.send(event);
    }

    /// Drops an entry that holds no cards and has no listeners
    pub fn release(&self, job_id: &str) {
        self.channels
            .remove_if(job_id, |_, channel| channel.sender.receiver_count() == 0 && channel.cards.is_empty());
    }

    /// Drops the job's entry without a terminal event
    pub fn close(&self, job_id: &str) {
        self.channels.remove(job_id);
    }
}
