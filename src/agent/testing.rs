//! In-memory agent used by the unit tests.

use super::transport::{HttpReply, HttpRequest, Transport, TransportError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
struct Scripted {
    delay: Option<Duration>,
    status: u16,
    body: String,
}

/// Answers per `(port, request name)`.
///
/// Scripted replies are served in order and the last one repeats. Anything
/// without a script fails like a closed port.
#[derive(Default)]
pub struct ScriptedTransport {
    routes: Mutex<HashMap<(u16, &'static str), VecDeque<Scripted>>>,
    seen: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Replaces the script for `name` on `port` with one repeating reply.
    pub fn reply(&self, port: u16, name: &'static str, status: u16, body: &str) -> &Self {
        self.script(port, name, &[(status, body)])
    }

    pub fn delayed_reply(
        &self,
        port: u16,
        name: &'static str,
        delay: Duration,
        status: u16,
        body: &str,
    ) -> &Self {
        let step = Scripted {
            delay: Some(delay),
            status,
            body: body.to_string(),
        };
        self.routes.lock().insert((port, name), VecDeque::from([step]));
        self
    }

    pub fn script(&self, port: u16, name: &'static str, replies: &[(u16, &str)]) -> &Self {
        let steps = replies
            .iter()
            .map(|(status, body)| Scripted {
                delay: None,
                status: *status,
                body: (*body).to_string(),
            })
            .collect();
        self.routes.lock().insert((port, name), steps);
        self
    }

    pub fn calls(&self, port: u16, name: &str) -> usize {
        self.seen
            .lock()
            .iter()
            .filter(|request| request.port == port && request.name == name)
            .count()
    }

    pub fn calls_named(&self, name: &str) -> usize {
        self.seen
            .lock()
            .iter()
            .filter(|request| request.name == name)
            .count()
    }

    pub fn last_request(&self, port: u16, name: &str) -> Option<HttpRequest> {
        self.seen
            .lock()
            .iter()
            .rev()
            .find(|request| request.port == port && request.name == name)
            .cloned()
    }

    fn next_step(&self, port: u16, name: &'static str) -> Option<Scripted> {
        let mut routes = self.routes.lock();
        let queue = routes.get_mut(&(port, name))?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn get(&self, request: HttpRequest) -> Result<HttpReply, TransportError> {
        let step = self.next_step(request.port, request.name);
        self.seen.lock().push(request);

        let Some(step) = step else {
            return Err(TransportError::Request("connection refused".to_string()));
        };
        if let Some(delay) = step.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(HttpReply {
            status: step.status,
            body: step.body,
        })
    }
}
