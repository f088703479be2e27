#![allow(dead_code)]

use async_trait::async_trait;
use kafka_worker::{BrokerMessage, MessageProcessor, ProcessingError};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Processor that replays scripted outcomes, then succeeds
#[derive(Default)]
pub struct ScriptedProcessor {
    outcomes: Mutex<VecDeque<Result<(), ProcessingError>>>,
    fallback: Mutex<Option<ProcessingError>>,
    delay: Mutex<Option<Duration>>,
    calls: Mutex<Vec<(i64, Instant)>>,
}

impl ScriptedProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_outcomes(outcomes: Vec<Result<(), ProcessingError>>) -> Self {
        let processor = Self::default();
        *processor.outcomes.lock().unwrap() = outcomes.into();
        processor
    }

    /// Fail with `err` once the script is exhausted
    pub fn failing_with(err: ProcessingError) -> Self {
        let processor = Self::default();
        *processor.fallback.lock().unwrap() = Some(err);
        processor
    }

    /// Make every call take `delay`
    pub fn slow(self, delay: Duration) -> Self {
        *self.delay.lock().unwrap() = Some(delay);
        self
    }

    pub fn succeed_from_now_on(&self) {
        self.outcomes.lock().unwrap().clear();
        *self.fallback.lock().unwrap() = None;
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn offsets(&self) -> Vec<i64> {
        self.calls.lock().unwrap().iter().map(|(o, _)| *o).collect()
    }

    /// Time between consecutive calls
    pub fn gaps(&self) -> Vec<Duration> {
        let calls = self.calls.lock().unwrap();
        calls.windows(2).map(|w| w[1].1 - w[0].1).collect()
    }
}

#[async_trait]
impl MessageProcessor for ScriptedProcessor {
    async fn process(&self, message: &BrokerMessage) -> Result<(), ProcessingError> {
        self.calls.lock().unwrap().push((message.offset, Instant::now()));
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.outcomes.lock().unwrap().pop_front();
        match scripted {
            Some(outcome) => outcome,
            None => match self.fallback.lock().unwrap().clone() {
                Some(err) => Err(err),
                None => Ok(()),
            },
        }
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

/// Poll `condition` every 10ms of (possibly paused) time until it holds
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    while !condition() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Fail the test if `fut` does not finish within `limit`
pub async fn within<T>(limit: Duration, fut: impl Future<Output = T>) -> T {
    match tokio::time::timeout(limit, fut).await {
        Ok(out) => out,
        Err(_) => panic!("did not finish within {limit:?}"),
    }
}
