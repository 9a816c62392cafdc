use std::{
    collections::{HashMap, HashSet},
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError},
        Mutex,
    },
    time::Duration,
};

use rand::{distributions::Alphanumeric, Rng};
use thiserror::Error;

use crate::{
    bus::{EventCategory, LogEvent},
    dispatch::Command,
};

/// How long the HTTP layer waits for the tick loop to answer.
pub const LOCAL_REPLY_TIMEOUT: Duration = Duration::from_secs(5);
pub const LOCAL_QUEUE_DEPTH: usize = 8;

pub const SESSION_COOKIE: &str = "LIGHTNODESESSION";
const SESSION_TOKEN_LEN: usize = 32;
const MAX_SESSIONS: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalReply {
    pub accepted: bool,
    pub restarting: bool,
    pub message: String,
}

impl LocalReply {
    pub fn accepted(restarting: bool) -> Self {
        Self {
            accepted: true,
            restarting,
            message: if restarting { "restarting" } else { "saved" }.to_string(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            accepted: false,
            restarting: false,
            message: message.into(),
        }
    }
}

pub struct LocalRequest {
    pub command: Command,
    reply: SyncSender<LocalReply>,
}

impl LocalRequest {
    pub fn respond(self, reply: LocalReply) {
        // The submitter may have timed out already.
        let _ = self.reply.send(reply);
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LocalError {
    #[error("control queue is full")]
    Busy,
    #[error("node is restarting")]
    Closed,
    #[error("no reply within {0:?}")]
    Timeout(Duration),
}

/// Sending half, held by the local control surface.
#[derive(Clone)]
pub struct LocalHandle {
    tx: SyncSender<LocalRequest>,
}

impl LocalHandle {
    pub fn submit(&self, command: Command, timeout: Duration) -> Result<LocalReply, LocalError> {
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        let request = LocalRequest {
            command,
            reply: reply_tx,
        };
        self.tx.try_send(request).map_err(|err| match err {
            TrySendError::Full(_) => LocalError::Busy,
            TrySendError::Disconnected(_) => LocalError::Closed,
        })?;
        reply_rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => LocalError::Timeout(timeout),
            RecvTimeoutError::Disconnected => LocalError::Closed,
        })
    }

    /// Queues a command without waiting for the tick loop's reply.
    pub fn notify(&self, command: Command) -> Result<(), LocalError> {
        let (reply_tx, _) = mpsc::sync_channel(1);
        let request = LocalRequest {
            command,
            reply: reply_tx,
        };
        self.tx.try_send(request).map_err(|err| match err {
            TrySendError::Full(_) => LocalError::Busy,
            TrySendError::Disconnected(_) => LocalError::Closed,
        })
    }
}

/// Receiving half, drained by the tick loop.
pub struct LocalInbox {
    rx: Receiver<LocalRequest>,
}

impl LocalInbox {
    pub fn drain(&self) -> Vec<LocalRequest> {
        self.rx.try_iter().collect()
    }
}

pub fn local_channel(depth: usize) -> (LocalHandle, LocalInbox) {
    let (tx, rx) = mpsc::sync_channel(depth);
    (LocalHandle { tx }, LocalInbox { rx })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginOutcome {
    Logout,
    Success,
    Failure,
}

impl LoginOutcome {
    /// Remote log entry for a login attempt. Passwords are never recorded.
    pub fn event(self, user: &str) -> LogEvent {
        match self {
            LoginOutcome::Logout => LogEvent::new(EventCategory::Login, 1, "Logout", ""),
            LoginOutcome::Success => {
                LogEvent::new(EventCategory::Login, 2, "Success", format!("User name: {user}"))
            }
            LoginOutcome::Failure => {
                LogEvent::new(EventCategory::Login, 2, "Failure", format!("User name: {user}"))
            }
        }
    }

    pub fn record(self, user: &str) -> Command {
        Command::Record(self.event(user))
    }
}

/// Admin login for the local control surface, backed by session cookies.
pub struct LocalAuth {
    user: String,
    password: String,
    sessions: Mutex<HashSet<String>>,
}

impl LocalAuth {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
            sessions: Mutex::new(HashSet::new()),
        }
    }

    /// Returns a fresh session token when the credentials match.
    pub fn login(&self, user: &str, password: &str) -> Option<String> {
        if user != self.user || password != self.password {
            return None;
        }
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(SESSION_TOKEN_LEN)
            .map(char::from)
            .collect();
        let mut sessions = self.sessions.lock().ok()?;
        if sessions.len() >= MAX_SESSIONS {
            sessions.clear();
        }
        sessions.insert(token.clone());
        Some(token)
    }

    pub fn logout(&self, cookie_header: Option<&str>) {
        if let (Some(token), Ok(mut sessions)) = (session_token(cookie_header), self.sessions.lock())
        {
            sessions.remove(token);
        }
    }

    pub fn is_authorized(&self, cookie_header: Option<&str>) -> bool {
        let Some(token) = session_token(cookie_header) else {
            return false;
        };
        self.sessions
            .lock()
            .map(|sessions| sessions.contains(token))
            .unwrap_or(false)
    }

    pub fn set_cookie(token: &str) -> String {
        format!("{SESSION_COOKIE}={token}; Path=/; HttpOnly")
    }
}

fn session_token(cookie_header: Option<&str>) -> Option<&str> {
    cookie_header?.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == SESSION_COOKIE && !value.is_empty()).then_some(value)
    })
}

/// Decodes an `application/x-www-form-urlencoded` body.
///
/// Later duplicates win; malformed escapes are kept literally.
pub fn decode_form(body: &str) -> HashMap<String, String> {
    body.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            (percent_decode(name), percent_decode(value))
        })
        .collect()
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' => {
                let escaped = value
                    .get(i + 1..i + 3)
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok());
                if let Some(byte) = escaped {
                    out.push(byte);
                    i += 3;
                    continue;
                }
                out.push(b'%');
            }
            byte => out.push(byte),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
