//! In-process doubles shared by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::exchange::{ExchangeAck, ExchangeError, ServerExchange};
use crate::models::QueueItem;

enum Reply {
    Respond(Result<ExchangeAck, ExchangeError>),
    Hang,
}

/// Server that answers from a per-entity script and accepts anything unscripted
#[derive(Default)]
pub struct ScriptedExchange {
    script: Mutex<HashMap<String, VecDeque<Reply>>>,
    submissions: Mutex<Vec<QueueItem>>,
    latency: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedExchange {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every submission takes `latency` before answering
    pub fn with_latency(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            latency: Some(latency),
            ..Self::default()
        })
    }

    pub fn respond(&self, entity_id: &str, reply: Result<ExchangeAck, ExchangeError>) {
        self.push(entity_id, Reply::Respond(reply));
    }

    /// The next submission for `entity_id` never answers
    pub fn hang(&self, entity_id: &str) {
        self.push(entity_id, Reply::Hang);
    }

    pub fn submissions(&self) -> Vec<QueueItem> {
        self.submissions.lock().unwrap().clone()
    }

    pub fn submitted_entities(&self) -> Vec<String> {
        self.submissions()
            .into_iter()
            .map(|item| item.entity_id)
            .collect()
    }

    /// Highest number of submissions that were awaiting an answer at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn push(&self, entity_id: &str, reply: Reply) {
        self.script
            .lock()
            .unwrap()
            .entry(entity_id.to_string())
            .or_default()
            .push_back(reply);
    }
}

#[async_trait]
impl ServerExchange for ScriptedExchange {
    async fn submit(&self, item: &QueueItem) -> Result<ExchangeAck, ExchangeError> {
        self.submissions.lock().unwrap().push(item.clone());
        let reply = self
            .script
            .lock()
            .unwrap()
            .get_mut(&item.entity_id)
            .and_then(VecDeque::pop_front);

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if matches!(reply, Some(Reply::Hang)) {
            std::future::pending::<()>().await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match reply {
            Some(Reply::Respond(result)) => result,
            Some(Reply::Hang) | None => Ok(ExchangeAck::default()),
        }
    }
}
