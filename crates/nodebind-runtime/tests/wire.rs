use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use nodebind_promise::Promise;
use nodebind_runtime::{
    BinderError, BinderId, BinderUri, Completion, Configuration, NodeConfig, Reply, Runtime,
    RuntimeConfig, Stub, Supervisor, WirePlugin,
};

const GREETER: &str = "demo.Greeter";
const SAY_HELLO: i32 = 1;
const SAY_HELLO_ASYNC: i32 = 2;
const NEVER: i32 = 3;
const NOTIFY: i32 = 4;

const WAIT: Duration = Duration::from_secs(5);

fn node(id: u32, uri: impl Into<String>) -> NodeConfig {
    NodeConfig {
        id,
        uri: uri.into(),
    }
}

fn greet(name: &str) -> String {
    if name == "Hello" {
        "Hi there".to_string()
    } else {
        format!("Who is {name}?")
    }
}

fn greeter(notified: Arc<AtomicUsize>) -> Stub {
    Stub::builder(GREETER)
        .on_call(SAY_HELLO, |name: String| Ok(greet(&name)))
        .on_deferred(SAY_HELLO_ASYNC, |name: String| {
            let reply = Promise::new();
            let settle = reply.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                settle.fulfil(greet(&name));
            });
            reply
        })
        .on(NEVER, |_| Reply::Deferred(Completion::new()))
        .on_oneway(NOTIFY, move |_: String| {
            notified.fetch_add(1, Ordering::SeqCst);
        })
        .build()
}

struct Pair {
    server: Runtime,
    client: Runtime,
    wire: Arc<WirePlugin>,
    uri: BinderUri,
    notified: Arc<AtomicUsize>,
}

fn pair_with(settings: RuntimeConfig) -> Pair {
    let server_config = Configuration {
        nodes: vec![node(2, "tcp://127.0.0.1:0")],
        services: Vec::new(),
    };
    let server = Runtime::new(2, server_config, settings.clone()).expect("server runtime should build");
    server.start().expect("server runtime should start");
    let addr = server.local_addr().expect("server should listen");

    let notified = Arc::new(AtomicUsize::new(0));
    let uri = server
        .register(Arc::new(greeter(Arc::clone(&notified))))
        .expect("greeter should register");

    let client_config = Configuration {
        nodes: vec![
            node(1, "tcp://127.0.0.1:0"),
            node(2, format!("tcp://{addr}")),
        ],
        services: Vec::new(),
    };
    let client = Runtime::new(1, client_config, settings).expect("client runtime should build");
    let wire = Arc::new(WirePlugin::new());
    client
        .register_plugin(wire.clone())
        .expect("plugin should register before start");
    client.start().expect("client runtime should start");

    Pair {
        server,
        client,
        wire,
        uri,
        notified,
    }
}

fn pair() -> Pair {
    pair_with(RuntimeConfig::default().with_shutdown_timeout(Duration::from_secs(2)))
}

fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[test]
fn hello_round_trip_over_tcp() {
    let pair = pair();
    let proxy = pair.client.proxy(&pair.uri).expect("proxy should resolve");
    assert!(!proxy.is_local());
    assert_eq!(proxy.descriptor(), Some(GREETER));

    let reply = proxy
        .call::<str, String>(SAY_HELLO_ASYNC, "Hello")
        .wait_timeout(WAIT);
    assert_eq!(reply, Ok("Hi there".to_string()));

    let reply = proxy.call::<str, String>(SAY_HELLO, "Bob").wait_timeout(WAIT);
    assert_eq!(reply, Ok("Who is Bob?".to_string()));

    assert_eq!(pair.wire.outbound_connections(), 1);
    let client = pair.wire.client(2).expect("connection should stay open");
    assert!(eventually(|| client.pending_len() == 0));
}

#[test]
fn uri_string_resolves_to_the_same_binder() {
    let pair = pair();
    let parsed: BinderUri = pair
        .uri
        .to_string()
        .parse()
        .expect("uri should parse");
    let proxy = pair.client.proxy(&parsed).expect("proxy should resolve");
    let reply = proxy.call::<str, String>(SAY_HELLO, "Hello").wait_timeout(WAIT);
    assert_eq!(reply, Ok("Hi there".to_string()));
}

#[test]
fn unknown_target_rejects_with_remote_exception() {
    let pair = pair();
    let missing = BinderUri::wire(BinderId::new(2, 999));
    let proxy = pair.client.proxy(&missing).expect("remote proxy should build");

    match proxy.transact(SAY_HELLO, Default::default()).wait_timeout(WAIT) {
        Err(BinderError::Remote { message, cause }) => {
            assert_eq!(message, "binder transaction failure");
            let cause = cause.expect("exception should carry a cause");
            assert!(cause.contains("target not found"), "cause was {cause}");
        }
        other => panic!("expected remote exception, got {other:?}"),
    }
}

#[test]
fn handler_failure_travels_back_as_exception() {
    let pair = pair();
    let proxy = pair.client.proxy(&pair.uri).expect("proxy should resolve");

    match proxy.transact(77, Default::default()).wait_timeout(WAIT) {
        Err(BinderError::Remote { cause, .. }) => {
            assert!(cause.unwrap_or_default().contains("77"));
        }
        other => panic!("expected remote exception, got {other:?}"),
    }
}

#[test]
fn unconfigured_node_fails_fast() {
    let pair = pair();
    let stranger = BinderUri::wire(BinderId::new(9, 1));
    let proxy = pair.client.proxy(&stranger).expect("remote proxy should build");

    let result = proxy.transact(SAY_HELLO, Default::default()).wait_timeout(WAIT);
    assert!(matches!(result, Err(BinderError::Connection(_))));
    assert_eq!(pair.wire.outbound_connections(), 0);
}

#[test]
fn concurrent_first_calls_share_one_connection() {
    let pair = pair();
    let proxy = pair.client.proxy(&pair.uri).expect("proxy should resolve");

    let handles: Vec<_> = (0..8)
        .map(|worker| {
            let proxy = proxy.clone();
            thread::spawn(move || {
                (0..20)
                    .map(|call| {
                        let name = if call % 2 == 0 {
                            "Hello".to_string()
                        } else {
                            format!("n{worker}-{call}")
                        };
                        let reply = proxy
                            .call::<str, String>(SAY_HELLO, &name)
                            .wait_timeout(WAIT)
                            .expect("call should succeed");
                        assert_eq!(reply, greet(&name));
                    })
                    .count()
            })
        })
        .collect();

    let total: usize = handles
        .into_iter()
        .map(|handle| handle.join().expect("caller thread should finish"))
        .sum();
    assert_eq!(total, 160);
    assert_eq!(pair.wire.outbound_connections(), 1);
    assert_eq!(pair.wire.client_count(), 1);
}

#[test]
fn timeout_rejects_and_clears_pending_entry() {
    let pair = pair();
    let proxy = pair
        .client
        .proxy(&pair.uri)
        .expect("proxy should resolve")
        .with_timeout(Duration::from_millis(100));

    let started = Instant::now();
    let result = proxy.transact(NEVER, Default::default()).wait_timeout(WAIT);
    assert_eq!(result, Err(BinderError::Timeout(Duration::from_millis(100))));
    assert!(started.elapsed() < Duration::from_secs(3));

    let client = pair.wire.client(2).expect("connection should stay open");
    assert_eq!(client.pending_len(), 0);

    let reply = proxy.call::<str, String>(SAY_HELLO, "Hello").wait_timeout(WAIT);
    assert_eq!(reply, Ok("Hi there".to_string()));
}

#[test]
fn timeout_clears_pending_entry_while_workers_are_busy() {
    let pair = pair_with(
        RuntimeConfig::default()
            .with_dispatch_workers(1)
            .with_shutdown_timeout(Duration::from_secs(3)),
    );
    let proxy = pair.client.proxy(&pair.uri).expect("proxy should resolve");

    let first = proxy.call::<str, String>(SAY_HELLO, "Hello");
    first.on_settled(|_| thread::sleep(Duration::from_millis(1500)));
    assert_eq!(first.wait_timeout(WAIT), Ok("Hi there".to_string()));

    let bounded = proxy.clone().with_timeout(Duration::from_millis(100));
    let result = bounded.transact(NEVER, Default::default()).wait_timeout(WAIT);
    assert_eq!(result, Err(BinderError::Timeout(Duration::from_millis(100))));

    let client = pair.wire.client(2).expect("connection should stay open");
    assert_eq!(client.pending_len(), 0);
}

#[test]
fn cancelled_call_frees_its_pending_entry() {
    let pair = pair();
    let proxy = pair.client.proxy(&pair.uri).expect("proxy should resolve");

    let call = proxy.transact(NEVER, Default::default());
    let client = pair.wire.client(2).expect("connection should be open");
    assert_eq!(client.pending_len(), 1);

    assert!(call.cancel());
    assert_eq!(client.pending_len(), 0);
    assert_eq!(call.wait(), Err(BinderError::Cancelled));
}

#[test]
fn runtime_connects_and_disconnects_nodes_on_demand() {
    let pair = pair();

    pair.client.connect(2).expect("configured node should connect");
    assert_eq!(pair.wire.outbound_connections(), 1);
    assert!(pair.wire.client(2).is_some());

    pair.client.connect(2).expect("second connect should reuse the connection");
    assert_eq!(pair.wire.outbound_connections(), 1);

    pair.client.connect(1).expect("own node needs no connection");
    assert!(matches!(
        pair.client.connect(9),
        Err(BinderError::Connection(msg)) if msg.contains("no configured address")
    ));

    assert!(pair.client.disconnect(2));
    assert!(pair.wire.client(2).is_none());
    assert!(!pair.client.disconnect(2));

    let proxy = pair.client.proxy(&pair.uri).expect("proxy should resolve");
    let reply = proxy.call::<str, String>(SAY_HELLO, "Hello").wait_timeout(WAIT);
    assert_eq!(reply, Ok("Hi there".to_string()));
    assert_eq!(pair.wire.outbound_connections(), 2);
}

#[test]
fn timeout_against_silent_peer() {
    let silent = TcpListener::bind("127.0.0.1:0").expect("silent listener should bind");
    let addr = silent.local_addr().expect("silent listener should have an address");
    let accepted = thread::spawn(move || silent.accept().map(|(stream, _)| stream));

    let config = Configuration {
        nodes: vec![node(1, "tcp://127.0.0.1:0"), node(3, format!("tcp://{addr}"))],
        services: Vec::new(),
    };
    let settings = RuntimeConfig::default()
        .with_transaction_timeout(Duration::from_millis(100))
        .with_shutdown_timeout(Duration::from_secs(2));
    let runtime = Runtime::new(1, config, settings).expect("runtime should build");
    runtime.start().expect("runtime should start");

    let proxy = runtime
        .proxy(&BinderUri::wire(BinderId::new(3, 1)))
        .expect("remote proxy should build");
    let result = proxy.transact(SAY_HELLO, Default::default()).wait_timeout(WAIT);
    assert_eq!(result, Err(BinderError::Timeout(Duration::from_millis(100))));

    let _stream = accepted
        .join()
        .expect("accept thread should finish")
        .expect("silent peer should accept");
    runtime.shutdown();
}

#[test]
fn closing_connection_rejects_all_pending() {
    let pair = pair();
    let proxy = pair.client.proxy(&pair.uri).expect("proxy should resolve");

    let waiting: Vec<Completion> = (0..5)
        .map(|_| proxy.transact(NEVER, Default::default()))
        .collect();
    let client = pair.wire.client(2).expect("connection should be open");
    assert!(eventually(|| client.pending_len() == 5));

    assert!(pair.wire.disconnect(2, "test"));
    for completion in waiting {
        assert!(matches!(
            completion.wait_timeout(WAIT),
            Err(BinderError::Connection(_))
        ));
    }
    assert_eq!(client.pending_len(), 0);

    let reply = proxy.call::<str, String>(SAY_HELLO, "Hello").wait_timeout(WAIT);
    assert_eq!(reply, Ok("Hi there".to_string()));
    assert_eq!(pair.wire.outbound_connections(), 2);
}

#[test]
fn peer_shutdown_rejects_pending_and_notifies_supervisors() {
    let pair = pair();
    let proxy = pair.client.proxy(&pair.uri).expect("proxy should resolve");
    let waiting = proxy.transact(NEVER, Default::default());
    let client = pair.wire.client(2).expect("connection should be open");
    assert!(eventually(|| client.pending_len() == 1));

    let exits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&exits);
    let supervisor: Arc<dyn Supervisor> = Arc::new(move |_: &BinderUri| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    proxy.link(Arc::clone(&supervisor));

    pair.server.shutdown();

    assert!(matches!(
        waiting.wait_timeout(WAIT),
        Err(BinderError::Connection(_))
    ));
    assert!(eventually(|| exits.load(Ordering::SeqCst) == 1));
    assert!(eventually(|| pair.wire.client(2).is_none()));
}

#[test]
fn oneway_leaves_nothing_pending() {
    let pair = pair();
    let proxy = pair.client.proxy(&pair.uri).expect("proxy should resolve");

    proxy.send(NOTIFY, "ping").expect("oneway should send");
    proxy.send(NOTIFY, "ping").expect("oneway should send");
    assert!(eventually(|| pair.notified.load(Ordering::SeqCst) == 2));

    let client = pair.wire.client(2).expect("connection should be open");
    assert_eq!(client.pending_len(), 0);
}

#[test]
fn idle_connection_closes_with_last_proxy() {
    let pair = pair_with(
        RuntimeConfig::default()
            .with_close_idle_connections(true)
            .with_shutdown_timeout(Duration::from_secs(2)),
    );
    let proxy = pair.client.proxy(&pair.uri).expect("proxy should resolve");
    let copy = proxy.clone();
    assert_eq!(pair.wire.proxy_count(2), 2);

    let reply = copy.call::<str, String>(SAY_HELLO, "Hello").wait_timeout(WAIT);
    assert_eq!(reply, Ok("Hi there".to_string()));

    drop(copy);
    assert!(pair.wire.client(2).is_some());
    drop(proxy);
    assert_eq!(pair.wire.proxy_count(2), 0);
    assert!(pair.wire.client(2).is_none());
}

#[test]
fn transact_before_start_is_refused() {
    let config = Configuration {
        nodes: vec![node(1, "tcp://127.0.0.1:0"), node(2, "tcp://127.0.0.1:1")],
        services: Vec::new(),
    };
    let runtime =
        Runtime::new(1, config, RuntimeConfig::default()).expect("runtime should build");
    let proxy = runtime
        .proxy(&BinderUri::wire(BinderId::new(2, 1)))
        .expect("remote proxy should build");
    let result = proxy.transact(SAY_HELLO, Default::default()).wait_timeout(WAIT);
    assert!(matches!(result, Err(BinderError::Connection(_))));
}
