//! Scripted remote transport
//!
//! Sessions answer transaction-control statements (`begin`, `savepoint`,
//! `release`, `rollback`, `commit`) with an empty result unless told to fail
//! them. Every other statement is answered by the responder closure.

use async_trait::async_trait;
use parking_lot::Mutex;
use shardcall_core::{
    ColumnDesc, RawResult, RemoteSession, RemoteTransport, TransportError, TypeId, WireFormat,
    WireParam, WireValue,
};
use std::sync::Arc;

const CONTROL_PREFIXES: [&str; 5] = ["begin", "savepoint", "release", "rollback", "commit"];

/// True for statements the dispatcher issues to forward transaction state
pub fn is_transaction_control(sql: &str) -> bool {
    CONTROL_PREFIXES.iter().any(|p| sql.starts_with(p))
}

/// Single text column with one row per entry
pub fn text_rows(rows: &[Option<&str>]) -> RawResult {
    RawResult::new(
        vec![ColumnDesc {
            name: "result".to_string(),
            type_id: TypeId(25),
        }],
        rows.iter()
            .map(|r| vec![r.map(|s| WireValue::Text(s.to_string()))])
            .collect(),
    )
}

/// How a session answers one statement
#[derive(Debug, Clone)]
pub enum Reply {
    /// Return these rows
    Rows(RawResult),
    /// The node reports an error; the session stays usable
    Fail(String),
    /// The session dies
    Lost(String),
    /// Never answer
    Hang,
}

impl Reply {
    /// No rows
    pub fn empty() -> Self {
        Reply::Rows(RawResult::empty())
    }

    /// One row with one text column
    pub fn value(text: &str) -> Self {
        Reply::Rows(text_rows(&[Some(text)]))
    }

    /// One text column, one row per entry
    pub fn rows(values: &[&str]) -> Self {
        let rows: Vec<Option<&str>> = values.iter().map(|v| Some(*v)).collect();
        Reply::Rows(text_rows(&rows))
    }
}

/// A statement as seen by the responder
#[derive(Debug)]
pub struct Statement<'a> {
    /// Session id, in connect order from 1
    pub session: u64,
    /// Address the session was opened with
    pub address: &'a str,
    /// Statement text
    pub sql: &'a str,
    /// Parameters
    pub params: &'a [WireParam],
    /// Requested format
    pub format: WireFormat,
}

/// Something that happened on the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A session was opened
    Connect {
        /// Session id
        session: u64,
        /// Address
        address: String,
    },
    /// A statement was sent
    Execute {
        /// Session id
        session: u64,
        /// Statement text
        sql: String,
        /// Parameters
        params: Vec<WireParam>,
        /// Requested format
        format: WireFormat,
    },
    /// A cancel request was sent
    Cancel {
        /// Session id
        session: u64,
    },
    /// A session was closed
    Close {
        /// Session id
        session: u64,
    },
}

type Responder = Arc<dyn Fn(&Statement<'_>) -> Reply + Send + Sync>;

struct ScriptState {
    responder: Responder,
    events: Vec<TransportEvent>,
    next_session: u64,
    fail_connect: bool,
    fail_cancel: bool,
    fail_control: Option<String>,
}

/// [`RemoteTransport`] whose sessions follow a script
#[derive(Clone)]
pub struct ScriptedTransport {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedTransport {
    /// Every statement succeeds with no rows
    pub fn new() -> Self {
        ScriptedTransport {
            state: Arc::new(Mutex::new(ScriptState {
                responder: Arc::new(|_| Reply::empty()),
                events: Vec::new(),
                next_session: 1,
                fail_connect: false,
                fail_cancel: false,
                fail_control: None,
            })),
        }
    }

    /// Answer non-control statements with `responder`
    pub fn respond<F>(&self, responder: F)
    where
        F: Fn(&Statement<'_>) -> Reply + Send + Sync + 'static,
    {
        self.state.lock().responder = Arc::new(responder);
    }

    /// Make connects fail
    pub fn set_fail_connect(&self, fail: bool) {
        self.state.lock().fail_connect = fail;
    }

    /// Make cancel requests fail
    pub fn set_fail_cancel(&self, fail: bool) {
        self.state.lock().fail_cancel = fail;
    }

    /// Make control statements starting with `prefix` fail
    pub fn fail_control(&self, prefix: &str) {
        self.state.lock().fail_control = Some(prefix.to_string());
    }

    /// Everything recorded so far
    pub fn events(&self) -> Vec<TransportEvent> {
        self.state.lock().events.clone()
    }

    /// Text of every statement sent, in order
    pub fn statements(&self) -> Vec<String> {
        self.state
            .lock()
            .events
            .iter()
            .filter_map(|e| match e {
                TransportEvent::Execute { sql, .. } => Some(sql.clone()),
                _ => None,
            })
            .collect()
    }

    /// Statement texts sent on one session
    pub fn statements_on(&self, session: u64) -> Vec<String> {
        self.state
            .lock()
            .events
            .iter()
            .filter_map(|e| match e {
                TransportEvent::Execute { session: s, sql, .. } if *s == session => {
                    Some(sql.clone())
                }
                _ => None,
            })
            .collect()
    }

    /// Number of sessions opened
    pub fn connects(&self) -> usize {
        self.state
            .lock()
            .events
            .iter()
            .filter(|e| matches!(e, TransportEvent::Connect { .. }))
            .count()
    }

    /// Address of each session, by id
    pub fn session_address(&self, session: u64) -> Option<String> {
        self.state.lock().events.iter().find_map(|e| match e {
            TransportEvent::Connect { session: s, address } if *s == session => {
                Some(address.clone())
            }
            _ => None,
        })
    }

    /// Forget recorded events
    pub fn clear_events(&self) {
        self.state.lock().events.clear();
    }
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteTransport for ScriptedTransport {
    async fn connect(&self, address: &str) -> Result<Box<dyn RemoteSession>, TransportError> {
        let mut state = self.state.lock();
        if state.fail_connect {
            return Err(TransportError::ConnectionLost(
                "could not connect to server".to_string(),
            ));
        }
        let id = state.next_session;
        state.next_session += 1;
        state.events.push(TransportEvent::Connect {
            session: id,
            address: address.to_string(),
        });
        Ok(Box::new(ScriptedSession {
            id,
            address: address.to_string(),
            state: Arc::clone(&self.state),
            lost: false,
        }))
    }
}

struct ScriptedSession {
    id: u64,
    address: String,
    state: Arc<Mutex<ScriptState>>,
    lost: bool,
}

#[async_trait]
impl RemoteSession for ScriptedSession {
    async fn execute(
        &mut self,
        sql: &str,
        params: &[WireParam],
        format: WireFormat,
    ) -> Result<RawResult, TransportError> {
        if self.lost {
            return Err(TransportError::ConnectionLost("session is gone".to_string()));
        }
        let reply = {
            let mut state = self.state.lock();
            state.events.push(TransportEvent::Execute {
                session: self.id,
                sql: sql.to_string(),
                params: params.to_vec(),
                format,
            });
            if is_transaction_control(sql) {
                match &state.fail_control {
                    Some(prefix) if sql.starts_with(prefix.as_str()) => {
                        Reply::Fail(format!("{} failed", prefix))
                    }
                    _ => Reply::empty(),
                }
            } else {
                let responder = Arc::clone(&state.responder);
                drop(state);
                responder(&Statement {
                    session: self.id,
                    address: &self.address,
                    sql,
                    params,
                    format,
                })
            }
        };
        match reply {
            Reply::Rows(raw) => Ok(raw),
            Reply::Fail(message) => Err(TransportError::Remote(message)),
            Reply::Lost(message) => {
                self.lost = true;
                Err(TransportError::ConnectionLost(message))
            }
            Reply::Hang => std::future::pending().await,
        }
    }

    async fn cancel(&mut self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.events.push(TransportEvent::Cancel { session: self.id });
        if state.fail_cancel {
            Err(TransportError::Remote("cancel request failed".to_string()))
        } else {
            Ok(())
        }
    }

    async fn close(&mut self) {
        self.state
            .lock()
            .events
            .push(TransportEvent::Close { session: self.id });
    }
}
