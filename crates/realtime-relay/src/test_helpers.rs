#![allow(clippy::unwrap_used, clippy::panic)]

//! Scriptable upstream doubles shared by the session and server tests.
//!
//! A [`FakeUpstream`] only finishes `connect` when its [`FakeController`]
//! says so, which lets tests hold a session in `ConnectingUpstream` for as
//! long as they like. Dropping the controller without resolving the connect
//! leaves the attempt pending forever.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Notify, mpsc, oneshot};

use crate::upstream::{
    ConnectError, ConnectionState, OpenedUpstream, SendError, SharedConnectionState,
    UpstreamConnector, UpstreamEvent, UpstreamEvents, UpstreamSession, UpstreamUnavailable,
};

#[derive(Debug, Default)]
struct FakeLog {
    sent: Mutex<Vec<Value>>,
    premature_sends: AtomicUsize,
    disconnects: AtomicUsize,
    reject_next: AtomicBool,
    fail_transport: AtomicBool,
    sent_notify: Notify,
}

pub struct FakeUpstream {
    state: SharedConnectionState,
    connect_rx: Option<oneshot::Receiver<Result<(), ConnectError>>>,
    log: Arc<FakeLog>,
}

#[async_trait]
impl UpstreamSession for FakeUpstream {
    async fn connect(&mut self) -> Result<(), ConnectError> {
        let current = self.state.get();
        if current != ConnectionState::Unconnected {
            return Err(ConnectError::InvalidState(current));
        }
        self.state.advance(ConnectionState::Connecting);

        let Some(rx) = self.connect_rx.take() else {
            return Err(ConnectError::InvalidState(ConnectionState::Connecting));
        };
        match rx.await {
            Ok(Ok(())) => {
                self.state.advance(ConnectionState::Connected);
                Ok(())
            }
            Ok(Err(e)) => {
                self.state.close();
                Err(e)
            }
            Err(_) => std::future::pending().await,
        }
    }

    async fn send(&mut self, event_type: &str, payload: Value) -> Result<(), SendError> {
        if !self.is_ready() {
            self.log.premature_sends.fetch_add(1, Ordering::SeqCst);
            return Err(SendError::NotConnected);
        }
        if self.log.fail_transport.load(Ordering::SeqCst) {
            self.state.close();
            return Err(SendError::Transport("connection reset".into()));
        }
        if self.log.reject_next.swap(false, Ordering::SeqCst) {
            return Err(SendError::InvalidPayload);
        }

        let mut event = payload;
        event["type"] = Value::String(event_type.to_owned());
        self.log.sent.lock().unwrap().push(event);
        self.log.sent_notify.notify_waiters();
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.state.get() == ConnectionState::Connected
    }

    async fn disconnect(&mut self) {
        self.log.disconnects.fetch_add(1, Ordering::SeqCst);
        self.state.close();
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }
}

/// Test-side handle steering one [`FakeUpstream`].
pub struct FakeController {
    state: SharedConnectionState,
    connect_tx: Option<oneshot::Sender<Result<(), ConnectError>>>,
    events_tx: Option<mpsc::Sender<UpstreamEvent>>,
    log: Arc<FakeLog>,
}

impl FakeController {
    pub fn complete_connect(&mut self) {
        if let Some(tx) = self.connect_tx.take() {
            let _ = tx.send(Ok(()));
        }
    }

    pub fn fail_connect(&mut self, err: ConnectError) {
        if let Some(tx) = self.connect_tx.take() {
            let _ = tx.send(Err(err));
        }
    }

    /// Deliver a server event to the session.
    pub async fn push_event(&self, event: Value) {
        if let Some(tx) = &self.events_tx {
            let _ = tx.send(UpstreamEvent::Server(event)).await;
        }
    }

    /// Report that the remote session ended.
    ///
    /// A pending connect is left alone, so the session only learns of the
    /// close through its event subscription.
    pub async fn close_upstream(&mut self) {
        if self.state.get() == ConnectionState::Connected {
            self.state.close();
        }
        if let Some(tx) = self.events_tx.take() {
            let _ = tx.send(UpstreamEvent::Closed).await;
        }
    }

    /// Make the next send fail as a rejected payload.
    pub fn reject_next_send(&self) {
        self.log.reject_next.store(true, Ordering::SeqCst);
    }

    /// Make every later send fail as a dead transport.
    pub fn fail_transport(&self) {
        self.log.fail_transport.store(true, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Value> {
        self.log.sent.lock().unwrap().clone()
    }

    /// Wait until at least `n` events were delivered, then return them all.
    pub async fn wait_for_sent(&self, n: usize) -> Vec<Value> {
        let wait = async {
            loop {
                let notified = self.log.sent_notify.notified();
                if self.log.sent.lock().unwrap().len() >= n {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {n} upstream sends"));
        self.sent()
    }

    pub fn premature_sends(&self) -> usize {
        self.log.premature_sends.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.log.disconnects.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }
}

/// Build an upstream handle and the controller that drives it.
pub fn fake_upstream() -> (OpenedUpstream, FakeController) {
    let state = SharedConnectionState::new();
    let (connect_tx, connect_rx) = oneshot::channel();
    let (events_tx, events_rx) = mpsc::channel(64);
    let log = Arc::new(FakeLog::default());

    let upstream = FakeUpstream {
        state: state.clone(),
        connect_rx: Some(connect_rx),
        log: Arc::clone(&log),
    };
    let controller = FakeController {
        state,
        connect_tx: Some(connect_tx),
        events_tx: Some(events_tx),
        log,
    };
    let opened = OpenedUpstream {
        session: Box::new(upstream),
        events: UpstreamEvents::new(events_rx),
    };
    (opened, controller)
}

/// Hands out pre-built fake upstreams in order.
#[derive(Default)]
pub struct FakeConnector {
    sessions: Mutex<VecDeque<OpenedUpstream>>,
    opened: AtomicUsize,
}

impl FakeConnector {
    /// Connector with `n` upstreams queued, plus their controllers.
    pub fn with_sessions(n: usize) -> (Arc<Self>, Vec<FakeController>) {
        let mut sessions = VecDeque::with_capacity(n);
        let mut controllers = Vec::with_capacity(n);
        for _ in 0..n {
            let (opened, controller) = fake_upstream();
            sessions.push_back(opened);
            controllers.push(controller);
        }
        let connector = Self {
            sessions: Mutex::new(sessions),
            opened: AtomicUsize::new(0),
        };
        (Arc::new(connector), controllers)
    }

    /// Connector that never produces an upstream.
    pub fn unavailable() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

impl UpstreamConnector for FakeConnector {
    fn open(&self) -> Result<OpenedUpstream, UpstreamUnavailable> {
        let next = self.sessions.lock().unwrap().pop_front();
        match next {
            Some(opened) => {
                self.opened.fetch_add(1, Ordering::SeqCst);
                Ok(opened)
            }
            None => Err(UpstreamUnavailable::MissingCredential),
        }
    }
}
