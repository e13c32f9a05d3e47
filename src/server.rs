use futures::channel::mpsc;
use futures::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::SessionConfig;
use crate::error::RemoteError;
use crate::message::{Ack, Invocation, InvocationMessage, Request, Response};
use crate::service::Service;
use crate::session::Session;

/// Error kind of the failure sent when an observable reuses the number of a
/// live session.
pub const STREAM_ALREADY_EXISTS: &str = "STREAM_ALREADY_EXISTS";

/// Dispatch `requests` to `root` until the request stream ends.
///
/// Requests are handled one at a time in arrival order. Operations and
/// sessions run on their own tasks and send their responses to `responses`.
pub async fn run(
    root: Arc<Service>,
    requests: impl Stream<Item = Request> + Unpin,
    responses: mpsc::Sender<Response>,
    config: SessionConfig,
) -> anyhow::Result<()> {
    let mut requests = requests;
    let mut request_dispatcher = RequestDispatcher {
        root,
        responses,
        config,
        sessions: HashMap::new(),
    };
    while let Some(request) = requests.next().await {
        request_dispatcher.handle_request(request);
    }
    Ok(())
}

struct RequestDispatcher {
    root: Arc<Service>,
    responses: mpsc::Sender<Response>,
    config: SessionConfig,
    /// Ack mailboxes of running sessions
    sessions: HashMap<u32, mpsc::UnboundedSender<Ack>>,
}

impl RequestDispatcher {
    fn handle_request(&mut self, msg: Request) {
        tracing::trace!(?msg, "handle request");
        match msg {
            Request::Invoke { number, message } => match message {
                InvocationMessage::Procedure(invocation) => self.fire(number, invocation),
                InvocationMessage::Function(invocation) => self.call(number, invocation),
                InvocationMessage::Observable(invocation) => self.observe(number, invocation),
            },
            Request::Ack { number, ack } => self.ack(number, ack),
        }
    }

    fn fire(&self, number: u32, invocation: Invocation) {
        let Invocation {
            name,
            arg_lists,
            getter_chain,
        } = invocation;
        let procedure = match self
            .root
            .resolve(getter_chain)
            .and_then(|target| target.fire(&name, arg_lists))
        {
            Ok(procedure) => procedure,
            Err(error) => {
                tracing::warn!(number, %error, "failed to dispatch procedure");
                return;
            }
        };
        async_std::task::spawn(async move {
            if let Err(error) = procedure.await {
                tracing::warn!(number, %name, %error, "procedure failed");
            }
        });
    }

    fn call(&self, number: u32, invocation: Invocation) {
        let Invocation {
            name,
            arg_lists,
            getter_chain,
        } = invocation;
        let function = self
            .root
            .resolve(getter_chain)
            .and_then(|target| target.call(&name, arg_lists));
        let mut responses = self.responses.clone();
        async_std::task::spawn(async move {
            let result = match function {
                Ok(function) => function.await,
                Err(error) => {
                    tracing::debug!(number, %error, "failed to dispatch function");
                    Err(RemoteError::from(error))
                }
            };
            let response = match result {
                Ok(value) => Response::success(number, value),
                Err(error) => Response::Failure { number, error },
            };
            if response.is_failure() {
                tracing::debug!(number, ?response, "function failed");
            }
            if let Err(error) = responses.send(response).await {
                tracing::warn!(response_id = ?number, ?error, "Failed to send response");
            }
        });
    }

    fn observe(&mut self, number: u32, invocation: Invocation) {
        let Invocation {
            name,
            arg_lists,
            getter_chain,
        } = invocation;
        tracing::debug!(number, %name, "observable request");

        self.sessions.retain(|_, acks| !acks.is_closed());
        if self.sessions.contains_key(&number) {
            self.send_failure(
                number,
                RemoteError::new(
                    STREAM_ALREADY_EXISTS,
                    format!("Stream with ID {} already exists", number),
                ),
            );
            return;
        }

        let source = match self
            .root
            .resolve(getter_chain)
            .and_then(|target| target.observe(&name, arg_lists))
        {
            Ok(source) => source,
            Err(error) => {
                tracing::debug!(number, %error, "failed to dispatch observable");
                self.send_failure(number, RemoteError::from(error));
                return;
            }
        };

        let (ack_sender, ack_receiver) = mpsc::unbounded();
        let session = Session::new(
            number,
            source,
            ack_receiver,
            self.responses.clone(),
            self.config,
        );
        async_std::task::spawn(session.run());
        self.sessions.insert(number, ack_sender);
    }

    fn ack(&mut self, number: u32, ack: Ack) {
        match self.sessions.get(&number) {
            Some(acks) => {
                if acks.unbounded_send(ack).is_err() {
                    tracing::debug!(number, ?ack, "session already ended");
                    self.sessions.remove(&number);
                }
            }
            None => tracing::debug!(number, ?ack, "ack for unknown session"),
        }
    }

    fn send_failure(&self, number: u32, error: RemoteError) {
        let mut responses = self.responses.clone();
        async_std::task::spawn(async move {
            // We don’t care if the connection has been dropped
            let _ = responses.send(Response::Failure { number, error }).await;
        });
    }
}
