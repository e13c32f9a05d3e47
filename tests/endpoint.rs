//! Two endpoints talking to each other over in-memory byte pipes and TCP.
use futures::prelude::*;
use rawrpc::{
    CallError, Config, DispatchError, Endpoint, GetterLink, Invocation, RemoteError, Service, Value,
    ENCODE_ERROR,
};
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

fn config() -> Config {
    Config {
        observable_ack_timeout: Duration::from_secs(2),
        heartbeat_interval: Duration::from_millis(20),
        call_timeout: Duration::from_secs(2),
        stream_idle_timeout: None,
    }
}

#[derive(Default, Clone)]
struct Counters {
    subscriptions: Arc<AtomicUsize>,
    produced: Arc<AtomicUsize>,
}

fn bank_service(counters: Counters) -> Service {
    let mut accounts = Service::new();
    accounts.add_getter("account", |(id,): (String,)| {
        let mut account = Service::new();
        let balance = if id == "alice" { 100i64 } else { 0 };
        account.add_function("balance", move |()| future::ready(Ok(balance)));
        account
    });

    let mut service = Service::new();
    service.add_service("accounts", accounts);
    service.add_function("fail", |()| {
        future::ready(Err::<(), _>(RemoteError::new(
            "IllegalStateException",
            "boom",
        )))
    });
    service.add_function("nested", |(depth,): (i32,)| {
        future::ready(Ok((0..depth).fold(Value::Null, |value, _| {
            Value::List(vec![value])
        })))
    });
    service.add_observable("ticks", move |(count,): (i32,)| {
        counters.subscriptions.fetch_add(1, Ordering::SeqCst);
        let produced = Arc::clone(&counters.produced);
        stream::iter(0..count).then(move |i| {
            let produced = Arc::clone(&produced);
            async move {
                async_std::task::sleep(Duration::from_millis(30)).await;
                produced.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Int(i))
            }
        })
    });
    service
}

/// Returns a client endpoint connected to a server endpoint serving
/// `service`.
fn connect(service: Service, config: &Config) -> (Endpoint, Endpoint) {
    let (client_send, server_receive) = futures::channel::mpsc::unbounded::<Vec<u8>>();
    let (server_send, client_receive) = futures::channel::mpsc::unbounded::<Vec<u8>>();
    let server = Endpoint::new(
        server_send,
        server_receive.map(Ok::<_, Infallible>),
        service,
        config,
    );
    let client = Endpoint::new_client(
        client_send,
        client_receive.map(Ok::<_, Infallible>),
        config,
    );
    (client, server)
}

#[async_std::test]
async fn call_through_getter_chain() {
    let _ = tracing_subscriber::fmt::try_init();
    let (mut client, _server) = connect(bank_service(Counters::default()), &config());

    let balance = client
        .client()
        .call(
            Invocation::new("balance")
                .through(GetterLink::new("accounts", vec![]))
                .through(GetterLink::new(
                    "account",
                    vec![vec![Value::String("alice".to_string())]],
                )),
        )
        .await
        .unwrap();
    assert_eq!(balance, Value::Long(100));
}

#[async_std::test]
async fn remote_error() {
    let _ = tracing_subscriber::fmt::try_init();
    let (mut client, _server) = connect(bank_service(Counters::default()), &config());

    match client.client().call(Invocation::new("fail")).await {
        Err(CallError::Remote(error)) => {
            assert_eq!(error.kind, "IllegalStateException");
            assert_eq!(error.message, "boom");
        }
        result => panic!("Unexpected result {:?}", result),
    }
}

#[async_std::test]
async fn dispatch_error() {
    let _ = tracing_subscriber::fmt::try_init();
    let (mut client, _server) = connect(bank_service(Counters::default()), &config());

    match client
        .client()
        .call(Invocation::new("balance").through(GetterLink::new("loans", vec![])))
        .await
    {
        Err(CallError::Dispatch(error)) => assert_eq!(error.kind, DispatchError::UNKNOWN_GETTER),
        result => panic!("Unexpected result {:?}", result),
    }

    let error = client
        .client()
        .subscribe(Invocation::new("ticks").args(vec![Value::String("five".to_string())]))
        .await
        .unwrap()
        .try_collect::<Vec<_>>()
        .await
        .unwrap_err();
    assert_eq!(
        error.remote_error().map(|error| error.kind.as_str()),
        Some(DispatchError::INVALID_ARGUMENT)
    );
}

#[async_std::test]
async fn result_that_cannot_be_encoded_keeps_connection() {
    let _ = tracing_subscriber::fmt::try_init();
    let (mut client, _server) = connect(bank_service(Counters::default()), &config());

    match client
        .client()
        .call(Invocation::new("nested").args(vec![Value::Int(200)]))
        .await
    {
        Err(CallError::Remote(error)) => assert_eq!(error.kind, ENCODE_ERROR),
        result => panic!("Unexpected result {:?}", result),
    }

    let value = client
        .client()
        .call(Invocation::new("nested").args(vec![Value::Int(2)]))
        .await
        .unwrap();
    assert_eq!(value, Value::List(vec![Value::List(vec![Value::Null])]));
}

#[async_std::test]
async fn invalid_packet_keeps_connection() {
    let _ = tracing_subscriber::fmt::try_init();
    let (client_send, server_receive) = futures::channel::mpsc::unbounded::<Vec<u8>>();
    let (server_send, client_receive) = futures::channel::mpsc::unbounded::<Vec<u8>>();
    let _server = Endpoint::new(
        server_send,
        server_receive.map(Ok::<_, Infallible>),
        bank_service(Counters::default()),
        &config(),
    );
    let bogus = rawrpc::encode::to_vec(&Value::Object(vec![
        ("type".to_string(), Value::String("bogus".to_string())),
        ("id".to_string(), Value::Long(1)),
    ]))
    .unwrap();
    client_send.unbounded_send(bogus).unwrap();

    let mut client = Endpoint::new_client(
        client_send,
        client_receive.map(Ok::<_, Infallible>),
        &config(),
    );
    let balance = client
        .client()
        .call(
            Invocation::new("balance")
                .through(GetterLink::new("accounts", vec![]))
                .through(GetterLink::new(
                    "account",
                    vec![vec![Value::String("alice".to_string())]],
                )),
        )
        .await
        .unwrap();
    assert_eq!(balance, Value::Long(100));
}

#[async_std::test]
async fn unreachable_peer_times_out() {
    let _ = tracing_subscriber::fmt::try_init();
    let config = Config {
        call_timeout: Duration::from_millis(50),
        ..config()
    };
    // Nobody reads the requests and nothing is ever received
    let (send, _unread) = futures::channel::mpsc::unbounded::<Vec<u8>>();
    let (_silent, receive) = futures::channel::mpsc::unbounded::<Vec<u8>>();
    let mut client = Endpoint::new_client(send, receive.map(Ok::<_, Infallible>), &config);

    let error = client
        .client()
        .call(Invocation::new("balance"))
        .await
        .unwrap_err();
    assert!(error.is_timeout(), "{:?}", error);
    assert!(error.remote_error().is_none());
}

#[async_std::test]
async fn subscription_delivers_all_elements() {
    let _ = tracing_subscriber::fmt::try_init();
    let counters = Counters::default();
    let (mut client, _server) = connect(bank_service(counters.clone()), &config());

    // Elements take longer than the heartbeat interval so heartbeats are
    // interleaved with them on the wire.
    let elements = client
        .client()
        .subscribe(Invocation::new("ticks").args(vec![Value::Int(5)]))
        .await
        .unwrap()
        .try_collect::<Vec<_>>()
        .await
        .unwrap();
    assert_eq!(elements, (0..5).map(Value::Int).collect::<Vec<_>>());
    assert_eq!(counters.produced.load(Ordering::SeqCst), 5);
}

#[async_std::test]
async fn subscriptions_are_independent() {
    let _ = tracing_subscriber::fmt::try_init();
    let counters = Counters::default();
    let (mut client, _server) = connect(bank_service(counters.clone()), &config());

    let invocation = Invocation::new("ticks").args(vec![Value::Int(3)]);
    let first = client.client().subscribe(invocation.clone()).await.unwrap();
    let second = client.client().subscribe(invocation).await.unwrap();
    assert_ne!(first.number(), second.number());

    let (first, second) = futures::join!(
        first.try_collect::<Vec<_>>(),
        second.try_collect::<Vec<_>>()
    );
    let expected = (0..3).map(Value::Int).collect::<Vec<_>>();
    assert_eq!(first.unwrap(), expected);
    assert_eq!(second.unwrap(), expected);
    assert_eq!(counters.subscriptions.load(Ordering::SeqCst), 2);
}

#[async_std::test]
async fn dropped_subscription_stops_production() {
    let _ = tracing_subscriber::fmt::try_init();
    let counters = Counters::default();
    let (mut client, _server) = connect(bank_service(counters.clone()), &config());

    let mut subscription = client
        .client()
        .subscribe(Invocation::new("ticks").args(vec![Value::Int(1000)]))
        .await
        .unwrap();
    assert_eq!(subscription.next().await.unwrap().unwrap(), Value::Int(0));
    assert_eq!(subscription.next().await.unwrap().unwrap(), Value::Int(1));
    drop(subscription);

    async_std::task::sleep(Duration::from_millis(200)).await;
    let produced = counters.produced.load(Ordering::SeqCst);
    assert!(produced <= 3, "produced {} elements", produced);
    async_std::task::sleep(Duration::from_millis(200)).await;
    assert_eq!(counters.produced.load(Ordering::SeqCst), produced);
}

#[async_std::test]
async fn tcp() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();
    let listener = async_std::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    async_std::task::spawn(async move {
        let (connection, _) = listener.accept().await.unwrap();
        let (read, write) = connection.split();
        let server = Endpoint::new(
            write.into_sink(),
            read_to_stream(read),
            bank_service(Counters::default()),
            &config(),
        );
        server.join().await
    });

    let connection = async_std::net::TcpStream::connect(addr).await?;
    let (read, write) = connection.split();
    let mut client = Endpoint::new_client(write.into_sink(), read_to_stream(read), &config());

    let balance = client
        .client()
        .call(
            Invocation::new("balance")
                .through(GetterLink::new("accounts", vec![]))
                .through(GetterLink::new(
                    "account",
                    vec![vec![Value::String("bob".to_string())]],
                )),
        )
        .await?;
    assert_eq!(balance, Value::Long(0));

    let ticks = client
        .client()
        .subscribe(Invocation::new("ticks").args(vec![Value::Int(2)]))
        .await?
        .try_collect::<Vec<_>>()
        .await?;
    assert_eq!(ticks, vec![Value::Int(0), Value::Int(1)]);
    Ok(())
}

/// Convert [AsyncRead] into a [Stream]. Polling the resulting stream will poll
/// the reader for 4096 bytes and return a [Vec] of all the bytes that were read.
fn read_to_stream(
    read: impl AsyncRead + Unpin,
) -> impl Stream<Item = Result<Vec<u8>, std::io::Error>> {
    const BUF_SIZE: usize = 4096;
    let mut read = read;
    let mut buf = vec![0u8; BUF_SIZE];
    futures::stream::poll_fn(move |cx| {
        let result = match futures::ready!(Pin::new(&mut read).poll_read(cx, &mut buf)) {
            Ok(size) => {
                if size == 0 {
                    None
                } else {
                    Some(Ok(Vec::from(&buf[..size])))
                }
            }
            Err(err) => Some(Err(err)),
        };
        Poll::Ready(result)
    })
}
