//! In-memory fakes for the HTTP and bus ports.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;

use crate::deconz::{HttpClient, HttpError};
use crate::mqtt::{Bus, BusError, BusEvent, InboundMessage};

/// Scripted gateway. Each URL answers from its own queue; the last answer
/// of a queue is repeated once the others are used up.
#[derive(Default)]
pub struct FakeHttp {
    answers: Mutex<HashMap<String, VecDeque<Option<Value>>>>,
    status: Mutex<HashMap<String, u16>>,
    failing_puts: Mutex<HashSet<String>>,
    gets: Mutex<Vec<String>>,
    puts: Mutex<Vec<(String, Value)>>,
}

impl FakeHttp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn answer(&self, url: &str, body: Value) -> &Self {
        self.push_answer(url, Some(body))
    }

    /// Make `url` fail with a 503.
    pub fn fail(&self, url: &str) -> &Self {
        self.push_answer(url, None)
    }

    pub fn status(&self, url: &str, status: u16) -> &Self {
        self.status.lock().unwrap().insert(url.to_string(), status);
        self
    }

    pub fn fail_put(&self, url: &str) -> &Self {
        self.failing_puts.lock().unwrap().insert(url.to_string());
        self
    }

    pub fn gets(&self) -> Vec<String> {
        self.gets.lock().unwrap().clone()
    }

    pub fn puts(&self) -> Vec<(String, Value)> {
        self.puts.lock().unwrap().clone()
    }

    fn push_answer(&self, url: &str, body: Option<Value>) -> &Self {
        self.answers
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(body);
        self
    }

    fn next_answer(&self, url: &str) -> Option<Value> {
        let mut answers = self.answers.lock().unwrap();
        let queue = answers.get_mut(url)?;
        if queue.len() > 1 {
            queue.pop_front().flatten()
        } else {
            queue.front().cloned().flatten()
        }
    }
}

fn unavailable(url: &str) -> HttpError {
    HttpError::Status {
        url: url.to_string(),
        status: 503,
    }
}

impl HttpClient for FakeHttp {
    async fn get_json(&self, url: &str) -> Result<Value, HttpError> {
        self.gets.lock().unwrap().push(url.to_string());
        self.next_answer(url)
            .ok_or_else(|| unavailable(url))
    }

    async fn put_json(&self, url: &str, body: &Value) -> Result<u16, HttpError> {
        self.puts
            .lock()
            .unwrap()
            .push((url.to_string(), body.clone()));
        if self.failing_puts.lock().unwrap().contains(url) {
            return Err(unavailable(url));
        }
        let status = self.status.lock().unwrap().get(url).copied();
        Ok(status.unwrap_or(200))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusOp {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    Disconnect,
}

/// Scripted broker. Clones share their script and call log, so a test can
/// keep one handle while the subscriber owns another. Once the script runs
/// dry the connection is reported as closed so the subscriber loop ends.
#[derive(Clone, Default)]
pub struct FakeBus {
    script: Arc<Mutex<VecDeque<BusEvent>>>,
    ops: Arc<Mutex<Vec<BusOp>>>,
    timeouts: Arc<Mutex<Vec<Duration>>>,
}

impl FakeBus {
    pub fn new(script: impl IntoIterator<Item = BusEvent>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into_iter().collect())),
            ..Self::default()
        }
    }

    pub fn ops(&self) -> Vec<BusOp> {
        self.ops.lock().unwrap().clone()
    }

    pub fn timeouts(&self) -> Vec<Duration> {
        self.timeouts.lock().unwrap().clone()
    }
}

impl Bus for FakeBus {
    async fn subscribe(&mut self, topics: &[String]) -> Result<(), BusError> {
        self.ops
            .lock()
            .unwrap()
            .push(BusOp::Subscribe(topics.to_vec()));
        Ok(())
    }

    async fn unsubscribe(&mut self, topics: &[String]) -> Result<(), BusError> {
        self.ops
            .lock()
            .unwrap()
            .push(BusOp::Unsubscribe(topics.to_vec()));
        Ok(())
    }

    async fn next_event(&mut self, idle_timeout: Duration) -> BusEvent {
        self.timeouts.lock().unwrap().push(idle_timeout);
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or(BusEvent::Fatal(BusError::Closed))
    }

    async fn disconnect(&mut self) -> Result<(), BusError> {
        self.ops.lock().unwrap().push(BusOp::Disconnect);
        Ok(())
    }
}

pub fn publish(topic: &str, payload: &str) -> BusEvent {
    BusEvent::Delivered(InboundMessage {
        topic: topic.to_string(),
        payload: payload.as_bytes().to_vec(),
    })
}
