//! Server side state machine of an observable invocation.
//!
//! A [Session] sends one element, then waits for the client to acknowledge it
//! before producing the next. At most one element is in flight per session.
use futures::channel::mpsc;
use futures::prelude::*;
use futures::stream::{BoxStream, FusedStream};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use crate::config::SessionConfig;
use crate::error::RemoteError;
use crate::message::{Ack, Response};
use crate::service::BoxObservable;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Delivering,
    AwaitingAck,
    Cancelled,
    Completed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Cancelled | SessionState::Completed | SessionState::Failed
        )
    }
}

pub struct Session {
    number: u32,
    source: BoxObservable,
    acks: mpsc::UnboundedReceiver<Ack>,
    responses: mpsc::Sender<Response>,
    config: SessionConfig,
    heartbeat: HeartbeatTimer,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("number", &self.number)
            .field("source", &"BoxStream")
            .field("config", &self.config)
            .field("heartbeat", &self.heartbeat)
            .finish()
    }
}

enum Event {
    Ack(Option<Ack>),
    Heartbeat,
    Item(Option<Result<Value, RemoteError>>),
}

impl Session {
    /// `acks` receives the client's acknowledgements for request `number`.
    /// The session treats a closed `acks` channel like a cancellation.
    pub fn new(
        number: u32,
        source: BoxObservable,
        acks: mpsc::UnboundedReceiver<Ack>,
        responses: mpsc::Sender<Response>,
        config: SessionConfig,
    ) -> Self {
        Self {
            number,
            source,
            acks,
            responses,
            config,
            heartbeat: HeartbeatTimer::stopped(),
        }
    }

    /// Drive the session until it reaches a terminal state.
    pub async fn run(mut self) -> SessionState {
        let mut state = SessionState::Idle;
        loop {
            state = match state {
                SessionState::Idle => {
                    self.heartbeat.start(self.config.heartbeat_interval);
                    SessionState::Delivering
                }
                SessionState::Delivering => self.deliver().await,
                SessionState::AwaitingAck => self.await_ack().await,
                terminal => {
                    self.heartbeat.stop();
                    return terminal;
                }
            };
            tracing::trace!(number = self.number, ?state, "session state");
            if state.is_terminal() {
                tracing::debug!(number = self.number, ?state, "session ended");
            }
        }
    }

    async fn deliver(&mut self) -> SessionState {
        loop {
            // Acks are polled first so that a cancellation is honoured before
            // the next element is produced.
            let event = futures::select_biased! {
                ack = self.acks.next() => Event::Ack(ack),
                _ = self.heartbeat.next() => Event::Heartbeat,
                item = self.source.next().fuse() => Event::Item(item),
            };
            match event {
                Event::Item(Some(Ok(value))) => {
                    let response = Response::success(self.number, value);
                    if response.is_failure() {
                        tracing::debug!(number = self.number, ?response, "element not encodable");
                        self.heartbeat.stop();
                        self.send(response).await;
                        return SessionState::Failed;
                    }
                    return if self.send(response).await {
                        SessionState::AwaitingAck
                    } else {
                        SessionState::Cancelled
                    };
                }
                Event::Item(Some(Err(error))) => {
                    self.heartbeat.stop();
                    let number = self.number;
                    self.send(Response::Failure { number, error }).await;
                    return SessionState::Failed;
                }
                Event::Item(None) => {
                    self.heartbeat.stop();
                    let number = self.number;
                    self.send(Response::StreamCompleted { number }).await;
                    return SessionState::Completed;
                }
                Event::Ack(Some(Ack::Cancel)) | Event::Ack(None) => {
                    return SessionState::Cancelled
                }
                Event::Ack(Some(Ack::Continue)) => {
                    tracing::warn!(number = self.number, "unexpected continue, ignoring");
                }
                Event::Heartbeat => {
                    if !self.send_heartbeat().await {
                        return SessionState::Cancelled;
                    }
                }
            }
        }
    }

    async fn await_ack(&mut self) -> SessionState {
        let timeout = async_std::task::sleep(self.config.ack_timeout).fuse();
        futures::pin_mut!(timeout);
        loop {
            let ack = futures::select_biased! {
                ack = self.acks.next() => ack,
                _ = timeout => {
                    tracing::debug!(
                        number = self.number,
                        timeout = ?self.config.ack_timeout,
                        "ack timed out, cancelling"
                    );
                    return SessionState::Cancelled;
                },
                _ = self.heartbeat.next() => {
                    if !self.send_heartbeat().await {
                        return SessionState::Cancelled;
                    }
                    continue;
                },
            };
            return match ack {
                Some(Ack::Continue) => SessionState::Delivering,
                Some(Ack::Cancel) | None => SessionState::Cancelled,
            };
        }
    }

    async fn send_heartbeat(&mut self) -> bool {
        let number = self.number;
        self.send(Response::Heartbeat { number }).await
    }

    async fn send(&mut self, response: Response) -> bool {
        match self.responses.send(response).await {
            Ok(()) => true,
            Err(error) => {
                tracing::warn!(number = self.number, ?error, "failed to send response");
                false
            }
        }
    }
}

/// Periodic heartbeat ticks. A stopped timer never yields.
pub struct HeartbeatTimer {
    ticks: Option<BoxStream<'static, ()>>,
}

impl HeartbeatTimer {
    pub fn stopped() -> Self {
        Self { ticks: None }
    }

    pub fn start(&mut self, period: Duration) {
        self.ticks = Some(async_std::stream::interval(period).boxed());
    }

    pub fn stop(&mut self) {
        self.ticks = None;
    }

    pub fn is_running(&self) -> bool {
        self.ticks.is_some()
    }
}

impl std::fmt::Debug for HeartbeatTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatTimer")
            .field("running", &self.is_running())
            .finish()
    }
}

impl Stream for HeartbeatTimer {
    type Item = ();

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<()>> {
        match self.ticks.as_mut() {
            Some(ticks) => match ticks.poll_next_unpin(cx) {
                Poll::Ready(Some(())) => Poll::Ready(Some(())),
                Poll::Ready(None) => {
                    self.ticks = None;
                    Poll::Pending
                }
                Poll::Pending => Poll::Pending,
            },
            None => Poll::Pending,
        }
    }
}

impl FusedStream for HeartbeatTimer {
    fn is_terminated(&self) -> bool {
        false
    }
}
