//! Scripted gateway for unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::{GcsError, Result};
use crate::gateway::{Gateway, GatewayEvent};

type Responder = Box<dyn FnMut(&str) -> Option<String> + Send>;

struct Step {
    expect: String,
    chunks: Vec<String>,
}

#[derive(Default)]
struct Shared {
    script: VecDeque<Step>,
    sent: Vec<String>,
}

/// Cloneable view on what a [`ScriptedGateway`] saw, usable after the
/// gateway has been moved into a connection.
#[derive(Clone)]
pub struct ScriptLog(Arc<Mutex<Shared>>);

impl ScriptLog {
    pub fn sent(&self) -> Vec<String> {
        self.0.lock().map(|s| s.sent.clone()).unwrap_or_default()
    }

    pub fn remaining(&self) -> usize {
        self.0.lock().map(|s| s.script.len()).unwrap_or_default()
    }
}

/// Replays `command -> answer` steps in order. Commands without a matching
/// step go to the optional responder; anything else is a transport error.
pub struct ScriptedGateway {
    shared: Arc<Mutex<Shared>>,
    outbox: VecDeque<String>,
    responder: Option<Responder>,
    timeout: Duration,
    events: broadcast::Sender<GatewayEvent>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(8);
        Self {
            shared: Arc::new(Mutex::new(Shared::default())),
            outbox: VecDeque::new(),
            responder: None,
            timeout: Duration::from_millis(500),
            events,
        }
    }

    fn push(self, expect: &str, chunks: Vec<String>) -> Self {
        if let Ok(mut s) = self.shared.lock() {
            s.script.push_back(Step {
                expect: expect.to_string(),
                chunks,
            });
        }
        self
    }

    pub fn expect_send(self, cmd: &str) -> Self {
        self.push(cmd, Vec::new())
    }

    pub fn expect_answer(self, cmd: &str, answer: &str) -> Self {
        self.push(cmd, vec![answer.to_string()])
    }

    /// Answer delivered over several reads.
    pub fn expect_chunks(self, cmd: &str, chunks: &[&str]) -> Self {
        self.push(cmd, chunks.iter().map(|c| (*c).to_string()).collect())
    }

    pub fn responder(mut self, f: impl FnMut(&str) -> Option<String> + Send + 'static) -> Self {
        self.responder = Some(Box::new(f));
        self
    }

    pub fn log(&self) -> ScriptLog {
        ScriptLog(Arc::clone(&self.shared))
    }

    pub fn events(&self) -> broadcast::Sender<GatewayEvent> {
        self.events.clone()
    }
}

#[async_trait]
impl Gateway for ScriptedGateway {
    async fn send(&mut self, text: &str) -> Result<()> {
        let cmd = text.strip_suffix('\n').unwrap_or(text);
        let step = {
            let mut s = self
                .shared
                .lock()
                .map_err(|_| GcsError::Transport("script poisoned".into()))?;
            s.sent.push(text.to_string());
            if s.script.front().is_some_and(|st| st.expect == cmd) {
                s.script.pop_front()
            } else {
                None
            }
        };
        if let Some(step) = step {
            self.outbox.extend(step.chunks);
            return Ok(());
        }
        if let Some(answer) = self.responder.as_mut().and_then(|r| r(cmd)) {
            if !answer.is_empty() {
                self.outbox.push_back(answer);
            }
            return Ok(());
        }
        Err(GcsError::Transport(format!("unexpected command {cmd:?}")))
    }

    async fn read(&mut self) -> Result<String> {
        if let Some(chunk) = self.outbox.pop_front() {
            return Ok(chunk);
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
        Ok(String::new())
    }

    async fn flush(&mut self) -> Result<()> {
        self.outbox.clear();
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn connected(&self) -> bool {
        true
    }

    fn connection_id(&self) -> u32 {
        0
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<GatewayEvent>> {
        Some(self.events.subscribe())
    }
}
