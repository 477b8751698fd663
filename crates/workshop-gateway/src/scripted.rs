//! In-process gateway with scripted replies
//!
//! Keeps a transcript per session and answers each `send` through a responder
//! closure. A reply becomes visible in `history` after a configurable number
//! of polls, mimicking generation latency.

use crate::rpc::{ChatRpc, ChatSendRequest, HistoryMessage};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;
use workshop_common::WorkshopError;

/// `(session_key, message) -> reply`; `None` leaves the prompt unanswered
pub type Responder = Arc<dyn Fn(&str, &str) -> Option<String> + Send + Sync>;

#[derive(Debug, Default)]
struct Session {
    messages: Vec<HistoryMessage>,
    pending: Option<(String, u32)>,
}

pub struct ScriptedGateway {
    responder: Responder,
    reply_after_polls: u32,
    connected: AtomicBool,
    failing: AtomicBool,
    sessions: Mutex<HashMap<String, Session>>,
    sent: Mutex<Vec<ChatSendRequest>>,
}

impl ScriptedGateway {
    pub fn new(responder: impl Fn(&str, &str) -> Option<String> + Send + Sync + 'static) -> Self {
        Self {
            responder: Arc::new(responder),
            reply_after_polls: 1,
            connected: AtomicBool::new(true),
            failing: AtomicBool::new(false),
            sessions: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Polls before a reply shows up; 0 answers synchronously
    pub fn with_reply_after(mut self, polls: u32) -> Self {
        self.reply_after_polls = polls;
        self
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Make every call fail until switched back
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<ChatSendRequest> {
        self.sent.lock().clone()
    }

    pub fn sent_to(&self, session_key: &str) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|r| r.session_key == session_key)
            .count()
    }

    pub fn transcript(&self, session_key: &str) -> Vec<HistoryMessage> {
        self.sessions
            .lock()
            .get(session_key)
            .map(|s| s.messages.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ChatRpc for ScriptedGateway {
    async fn send(&self, request: ChatSendRequest) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(WorkshopError::Gateway(format!("chat.send failed for {}", request.session_key)).into());
        }
        let reply = (self.responder)(&request.session_key, &request.message);
        {
            let mut sessions = self.sessions.lock();
            let session = sessions.entry(request.session_key.clone()).or_default();
            session.messages.push(HistoryMessage::user(request.message.clone()));
            session.pending = None;
            match reply {
                Some(text) if self.reply_after_polls == 0 => {
                    session.messages.push(HistoryMessage::assistant(text));
                }
                Some(text) => session.pending = Some((text, self.reply_after_polls)),
                None => debug!("No scripted reply for {}", request.session_key),
            }
        }
        self.sent.lock().push(request);
        Ok(())
    }

    async fn history(&self, session_key: &str, limit: usize) -> anyhow::Result<Vec<HistoryMessage>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(WorkshopError::Gateway(format!("chat.history failed for {}", session_key)).into());
        }
        let mut sessions = self.sessions.lock();
        let Some(session) = sessions.get_mut(session_key) else {
            return Ok(Vec::new());
        };
        if let Some((text, remaining)) = session.pending.take() {
            if remaining <= 1 {
                session.messages.push(HistoryMessage::assistant(text));
            } else {
                session.pending = Some((text, remaining - 1));
            }
        }
        let start = session.messages.len().saturating_sub(limit);
        Ok(session.messages[start..].to_vec())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
