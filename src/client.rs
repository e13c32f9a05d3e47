use chashmap::CHashMap;
use futures::channel::{mpsc, oneshot};
use futures::prelude::*;
use futures::stream::BoxStream;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use crate::config::ClientConfig;
use crate::error::RemoteError;
use crate::message::{Ack, Invocation, InvocationMessage, Request, Response};
use crate::service::DispatchError;
use crate::value::Value;

type PendingCalls = CHashMap<u32, oneshot::Sender<Result<Value, RemoteError>>>;
type Subscriptions = CHashMap<u32, mpsc::UnboundedSender<StreamEvent>>;

/// Client side of the protocol. Correlates responses with the requests that
/// caused them.
pub struct Client {
    request_sink: BoxRequestSink,
    next_request_number: u32,
    pending_calls: Arc<PendingCalls>,
    subscriptions: Arc<Subscriptions>,
    connected: Arc<AtomicBool>,
    config: ClientConfig,
    response_reader_handle: async_std::task::JoinHandle<()>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("sink", &"Pin<Box<dyn Sink>>")
            .field("next_request_number", &self.next_request_number)
            .field("pending_calls", &self.pending_calls)
            .field("subscriptions", &"Arc<CHashMap<_, _>>")
            .field("config", &self.config)
            .field("response_reader_task", &self.response_reader_handle)
            .finish()
    }
}

impl Client {
    pub fn new<RequestSink, ResponseStream>(
        request_sink: RequestSink,
        response_stream: ResponseStream,
        config: ClientConfig,
    ) -> Self
    where
        RequestSink: Sink<Request> + Send + Clone + Unpin + 'static,
        RequestSink::Error: std::error::Error + Send + Sync + 'static,
        ResponseStream: Stream<Item = Response> + Send + Unpin + 'static,
    {
        let request_sink: BoxRequestSink =
            Box::pin(request_sink.sink_map_err(anyhow::Error::from));
        let ack_sink = request_sink.dup();
        let pending_calls = Arc::new(CHashMap::new());
        let subscriptions = Arc::new(CHashMap::new());
        let pending_calls2 = Arc::clone(&pending_calls);
        let subscriptions2 = Arc::clone(&subscriptions);
        let connected = Arc::new(AtomicBool::new(true));
        let connected2 = Arc::clone(&connected);
        let response_reader_task = async_std::task::spawn(async move {
            Self::consume_responses(response_stream, ack_sink, &pending_calls2, &subscriptions2)
                .await;
            connected2.store(false, Ordering::SeqCst);
            // Dropping the senders resolves every waiting caller with `Disconnected`.
            pending_calls2.clear();
            subscriptions2.clear();
        });
        Self {
            request_sink,
            next_request_number: 1,
            pending_calls,
            subscriptions,
            connected,
            config,
            response_reader_handle: response_reader_task,
        }
    }

    /// Resolves when the response stream has ended.
    pub async fn join(self) {
        self.response_reader_handle.await
    }

    #[tracing::instrument(skip(response_stream, ack_sink, pending_calls, subscriptions))]
    async fn consume_responses<Stream_>(
        response_stream: Stream_,
        mut ack_sink: BoxRequestSink,
        pending_calls: &PendingCalls,
        subscriptions: &Subscriptions,
    ) where
        Stream_: Stream<Item = Response> + Send + Unpin + 'static,
    {
        let mut response_stream = response_stream;
        while let Some(response) = response_stream.next().await {
            tracing::trace!(?response, "received response");
            match response {
                Response::Success { number, value } => {
                    if let Some(respond) = pending_calls.remove(&number) {
                        if respond.send(Ok(value)).is_err() {
                            tracing::debug!(number, "caller gave up on response");
                        }
                        continue;
                    }
                    let event = StreamEvent::Element(value);
                    let ack = match Self::deliver(subscriptions, number, event) {
                        Some(ack) => ack,
                        None => {
                            tracing::warn!(number, "received response for unknown request");
                            continue;
                        }
                    };
                    if let Err(error) = ack_sink.send(Request::Ack { number, ack }).await {
                        tracing::warn!(number, ?ack, ?error, "failed to send ack");
                    }
                }
                Response::Failure { number, error } => {
                    if let Some(respond) = pending_calls.remove(&number) {
                        let _ = respond.send(Err(error));
                    } else if let Some(subscriber) = subscriptions.remove(&number) {
                        // We don’t care if the subscriber is gone.
                        let _ = subscriber.unbounded_send(StreamEvent::Failed(error));
                    } else {
                        tracing::warn!(number, %error, "received failure for unknown request");
                    }
                }
                Response::Heartbeat { number } => {
                    if let Some(Ack::Cancel) =
                        Self::deliver(subscriptions, number, StreamEvent::Heartbeat)
                    {
                        let ack = Ack::Cancel;
                        if let Err(error) = ack_sink.send(Request::Ack { number, ack }).await {
                            tracing::warn!(number, ?ack, ?error, "failed to send ack");
                        }
                    }
                }
                Response::StreamCompleted { number } => {
                    if let Some(subscriber) = subscriptions.remove(&number) {
                        let _ = subscriber.unbounded_send(StreamEvent::Completed);
                    } else {
                        tracing::warn!(stream_id = ?number, "received response for unknown stream");
                    }
                }
            }
        }
        tracing::debug!("response stream ended");
    }

    /// Hand `event` to the subscription `number`. Returns [Ack::Cancel] and
    /// forgets the subscription if it has been dropped. Returns `None` if
    /// there is no such subscription.
    fn deliver(subscriptions: &Subscriptions, number: u32, event: StreamEvent) -> Option<Ack> {
        let ack = {
            let subscriber = subscriptions.get(&number)?;
            if subscriber.unbounded_send(event).is_ok() {
                Ack::Continue
            } else {
                Ack::Cancel
            }
        };
        if ack == Ack::Cancel {
            tracing::debug!(number, "subscription dropped, cancelling");
            subscriptions.remove(&number);
        }
        Some(ack)
    }

    fn next_number(&mut self) -> u32 {
        let number = self.next_request_number;
        self.next_request_number = number.checked_add(1).unwrap_or(1);
        number
    }

    async fn send_request(&mut self, request: Request) -> Result<(), CallError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(CallError::Disconnected);
        }
        self.request_sink
            .send(request)
            .await
            .map_err(|error| CallError::Send { error })
    }

    /// Invoke a procedure. The server never responds.
    pub async fn fire(&mut self, invocation: Invocation) -> Result<(), CallError> {
        let number = self.next_number();
        let message = InvocationMessage::Procedure(invocation);
        self.send_request(Request::Invoke { number, message }).await
    }

    /// Invoke a function and wait at most the configured call timeout for its
    /// result.
    pub async fn call(&mut self, invocation: Invocation) -> Result<Value, CallError> {
        let number = self.next_number();
        let (sender, receiver) = oneshot::channel();
        self.pending_calls.insert(number, sender);

        let message = InvocationMessage::Function(invocation);
        if let Err(error) = self.send_request(Request::Invoke { number, message }).await {
            self.pending_calls.remove(&number);
            return Err(error);
        }

        let timeout = self.config.call_timeout;
        match async_std::future::timeout(timeout, receiver).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(error))) => Err(CallError::from_remote(error)),
            Ok(Err(oneshot::Canceled)) => Err(CallError::Disconnected),
            Err(_) => {
                tracing::debug!(number, ?timeout, "call timed out");
                self.pending_calls.remove(&number);
                Err(CallError::Timeout(RemoteTimeoutError { timeout }))
            }
        }
    }

    /// Subscribe to an observable. Every subscription starts its own session
    /// on the server.
    pub async fn subscribe(&mut self, invocation: Invocation) -> Result<Subscription, CallError> {
        let number = self.next_number();
        let (sender, receiver) = mpsc::unbounded();
        self.subscriptions.insert(number, sender);

        let message = InvocationMessage::Observable(invocation);
        if let Err(error) = self.send_request(Request::Invoke { number, message }).await {
            self.subscriptions.remove(&number);
            return Err(error);
        }
        Ok(Subscription::new(
            number,
            receiver,
            self.config.stream_idle_timeout,
        ))
    }
}

#[derive(Debug)]
enum StreamEvent {
    Element(Value),
    Heartbeat,
    Failed(RemoteError),
    Completed,
}

/// Elements of an observable in the order the server sent them.
///
/// The stream ends when the server completes the observable. A failure is
/// the last item. Dropping the subscription cancels it on the server.
pub struct Subscription {
    number: u32,
    elements: BoxStream<'static, Result<Value, CallError>>,
}

impl Subscription {
    fn new(
        number: u32,
        events: mpsc::UnboundedReceiver<StreamEvent>,
        idle_timeout: Option<Duration>,
    ) -> Self {
        let elements = stream::unfold(Some(events), move |state| async move {
            let mut events = state?;
            loop {
                let event = match idle_timeout {
                    Some(timeout) => match async_std::future::timeout(timeout, events.next()).await
                    {
                        Ok(event) => event,
                        Err(_) => {
                            let error = CallError::Timeout(RemoteTimeoutError { timeout });
                            return Some((Err(error), None));
                        }
                    },
                    None => events.next().await,
                };
                match event {
                    Some(StreamEvent::Heartbeat) => continue,
                    Some(StreamEvent::Element(value)) => return Some((Ok(value), Some(events))),
                    Some(StreamEvent::Failed(error)) => {
                        return Some((Err(CallError::from_remote(error)), None))
                    }
                    Some(StreamEvent::Completed) => return None,
                    None => return Some((Err(CallError::Disconnected), None)),
                }
            }
        })
        .boxed();
        Self { number, elements }
    }

    pub fn number(&self) -> u32 {
        self.number
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("number", &self.number)
            .finish()
    }
}

impl Stream for Subscription {
    type Item = Result<Value, CallError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Self::Item>> {
        self.elements.poll_next_unpin(cx)
    }
}

type BoxRequestSink = Pin<Box<dyn ClonableRequestSink>>;

trait ClonableRequestSink
where
    Self: Sink<Request, Error = anyhow::Error> + Send,
{
    fn dup(&self) -> BoxRequestSink;
}

impl<T> ClonableRequestSink for T
where
    T: Sink<Request, Error = anyhow::Error> + Send,
    T: Clone + 'static,
{
    fn dup(&self) -> BoxRequestSink {
        Box::pin(self.clone())
    }
}

/// No response arrived within the configured time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("No response received within {timeout:?}")]
pub struct RemoteTimeoutError {
    pub timeout: Duration,
}

#[derive(Debug, thiserror::Error)]
/// Error returned by [Client] operations and [Subscription]s.
pub enum CallError {
    /// Failed to send the request to the server
    #[error("Failed to send request")]
    Send {
        /// Error returned by the underlying transport channel
        #[source]
        error: anyhow::Error,
    },
    /// The remote operation failed
    #[error("Remote call failed: {0}")]
    Remote(#[source] RemoteError),
    /// The server could not resolve the invocation
    #[error("Remote dispatch failed: {0}")]
    Dispatch(#[source] RemoteError),
    #[error(transparent)]
    Timeout(#[from] RemoteTimeoutError),
    /// The connection closed before a response arrived
    #[error("Connection closed")]
    Disconnected,
}

impl CallError {
    fn from_remote(error: RemoteError) -> Self {
        if DispatchError::is_dispatch_kind(&error.kind) {
            CallError::Dispatch(error)
        } else {
            CallError::Remote(error)
        }
    }

    /// The error sent by the server, if any.
    pub fn remote_error(&self) -> Option<&RemoteError> {
        match self {
            CallError::Remote(error) | CallError::Dispatch(error) => Some(error),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, CallError::Timeout(_))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct TestServer {
        requests: mpsc::Receiver<Request>,
        responses: mpsc::Sender<Response>,
    }

    impl TestServer {
        async fn recv(&mut self) -> Option<Request> {
            self.requests.next().await
        }

        async fn send(&mut self, response: Response) {
            self.responses.send(response).await.unwrap();
        }
    }

    fn config() -> ClientConfig {
        ClientConfig {
            call_timeout: Duration::from_secs(10),
            stream_idle_timeout: None,
        }
    }

    fn connect(config: ClientConfig) -> (Client, TestServer) {
        let (request_sender, requests) = mpsc::channel(10);
        let (responses, response_receiver) = mpsc::channel(10);
        let client = Client::new(request_sender, response_receiver, config);
        (
            client,
            TestServer {
                requests,
                responses,
            },
        )
    }

    #[async_std::test]
    async fn call() {
        let _ = tracing_subscriber::fmt::try_init();
        let (mut client, mut server) = connect(config());

        let server_task = async move {
            let request = server.recv().await.unwrap();
            assert_eq!(
                request,
                Request::Invoke {
                    number: 1,
                    message: InvocationMessage::Function(
                        Invocation::new("add").args(vec![Value::Int(1), Value::Int(2)])
                    ),
                }
            );
            server
                .send(Response::Success {
                    number: 1,
                    value: Value::Int(3),
                })
                .await;
            server
        };
        let (result, _server) = futures::join!(
            client.call(Invocation::new("add").args(vec![Value::Int(1), Value::Int(2)])),
            server_task
        );
        assert_eq!(result.unwrap(), Value::Int(3));
    }

    #[async_std::test]
    async fn remote_and_dispatch_errors() {
        let _ = tracing_subscriber::fmt::try_init();
        let (mut client, mut server) = connect(config());

        let server_task = async move {
            server.recv().await.unwrap();
            server
                .send(Response::Failure {
                    number: 1,
                    error: RemoteError::new("IllegalStateException", "boom"),
                })
                .await;
            server.recv().await.unwrap();
            server
                .send(Response::Failure {
                    number: 2,
                    error: RemoteError::new("UNKNOWN_OPERATION", "Operation \"x\" not found"),
                })
                .await;
            server
        };
        let (results, _server) = futures::join!(
            async {
                vec![
                    client.call(Invocation::new("fail")).await,
                    client.call(Invocation::new("x")).await,
                ]
            },
            server_task
        );
        match &results[0] {
            Err(CallError::Remote(error)) => {
                assert_eq!(error, &RemoteError::new("IllegalStateException", "boom"))
            }
            result => panic!("Unexpected result {:?}", result),
        }
        match &results[1] {
            Err(CallError::Dispatch(error)) => assert_eq!(error.kind, "UNKNOWN_OPERATION"),
            result => panic!("Unexpected result {:?}", result),
        }
    }

    #[async_std::test]
    async fn call_timeout() {
        let _ = tracing_subscriber::fmt::try_init();
        let (mut client, mut server) = connect(ClientConfig {
            call_timeout: Duration::from_millis(50),
            stream_idle_timeout: None,
        });

        let error = client.call(Invocation::new("slow")).await.unwrap_err();
        assert!(error.is_timeout(), "{:?}", error);
        assert!(error.remote_error().is_none());
        assert!(client.pending_calls.is_empty());

        // A late response is ignored
        server.recv().await.unwrap();
        server
            .send(Response::Success {
                number: 1,
                value: Value::Null,
            })
            .await;
    }

    #[async_std::test]
    async fn disconnected() {
        let _ = tracing_subscriber::fmt::try_init();
        let (mut client, server) = connect(config());
        let TestServer {
            mut requests,
            responses,
        } = server;

        let (result, _requests) = futures::join!(client.call(Invocation::new("add")), async {
            requests.next().await.unwrap();
            drop(responses);
            requests
        });
        let error = result.unwrap_err();
        assert!(matches!(error, CallError::Disconnected), "{:?}", error);

        // Once the reader has stopped new requests fail right away
        while client.connected.load(Ordering::SeqCst) {
            async_std::task::yield_now().await;
        }
        let error = client.call(Invocation::new("add")).await.unwrap_err();
        assert!(matches!(error, CallError::Disconnected), "{:?}", error);
        assert!(client.pending_calls.is_empty());
    }

    #[async_std::test]
    async fn fire() {
        let _ = tracing_subscriber::fmt::try_init();
        let (mut client, mut server) = connect(config());
        client.fire(Invocation::new("log")).await.unwrap();
        client.fire(Invocation::new("log")).await.unwrap();
        assert_eq!(server.recv().await.unwrap().number(), 1);
        assert_eq!(server.recv().await.unwrap().number(), 2);
    }

    #[async_std::test]
    async fn subscription_acks_elements() {
        let _ = tracing_subscriber::fmt::try_init();
        let (mut client, mut server) = connect(config());
        let subscription = client.subscribe(Invocation::new("ticks")).await.unwrap();
        let number = subscription.number();

        assert!(matches!(
            server.recv().await,
            Some(Request::Invoke {
                message: InvocationMessage::Observable(_),
                ..
            })
        ));
        server.send(Response::Heartbeat { number }).await;
        for i in 0..3 {
            server
                .send(Response::Success {
                    number,
                    value: Value::Int(i),
                })
                .await;
            assert_eq!(
                server.recv().await,
                Some(Request::Ack {
                    number,
                    ack: Ack::Continue
                })
            );
            server.send(Response::Heartbeat { number }).await;
        }
        server.send(Response::StreamCompleted { number }).await;

        let elements = subscription.try_collect::<Vec<_>>().await.unwrap();
        assert_eq!(elements, vec![Value::Int(0), Value::Int(1), Value::Int(2)]);
    }

    #[async_std::test]
    async fn subscription_failure() {
        let _ = tracing_subscriber::fmt::try_init();
        let (mut client, mut server) = connect(config());
        let mut subscription = client.subscribe(Invocation::new("ticks")).await.unwrap();
        let number = subscription.number();
        server.recv().await.unwrap();

        server
            .send(Response::Failure {
                number,
                error: RemoteError::new("IllegalStateException", "boom"),
            })
            .await;
        match subscription.next().await {
            Some(Err(CallError::Remote(error))) => assert_eq!(error.message, "boom"),
            item => panic!("Unexpected item {:?}", item),
        }
        assert!(subscription.next().await.is_none());
    }

    #[async_std::test]
    async fn dropped_subscription_is_cancelled() {
        let _ = tracing_subscriber::fmt::try_init();
        let (mut client, mut server) = connect(config());
        let subscription = client.subscribe(Invocation::new("ticks")).await.unwrap();
        let number = subscription.number();
        server.recv().await.unwrap();
        drop(subscription);

        server
            .send(Response::Success {
                number,
                value: Value::Int(0),
            })
            .await;
        assert_eq!(
            server.recv().await,
            Some(Request::Ack {
                number,
                ack: Ack::Cancel
            })
        );
        assert!(client.subscriptions.is_empty());
    }

    #[async_std::test]
    async fn idle_subscription_times_out() {
        let _ = tracing_subscriber::fmt::try_init();
        let (mut client, mut server) = connect(ClientConfig {
            call_timeout: Duration::from_secs(10),
            stream_idle_timeout: Some(Duration::from_millis(50)),
        });
        let mut subscription = client.subscribe(Invocation::new("ticks")).await.unwrap();
        server.recv().await.unwrap();

        match subscription.next().await {
            Some(Err(CallError::Timeout(RemoteTimeoutError { timeout }))) => {
                assert_eq!(timeout, Duration::from_millis(50))
            }
            item => panic!("Unexpected item {:?}", item),
        }
        assert!(subscription.next().await.is_none());
    }

    #[test]
    fn request_numbers_skip_zero() {
        async_std::task::block_on(async {
            let (mut client, _server) = connect(config());
            client.next_request_number = u32::MAX;
            assert_eq!(client.next_number(), u32::MAX);
            assert_eq!(client.next_number(), 1);
        });
    }
}
