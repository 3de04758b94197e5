//! Listener integration tests.
//! Exercises resource selection, parameter checks, deferred accept callbacks
//! and the interaction with blocked async delivery and listener close.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use mm_iface::{AmHandler, MmEp, MmIface, MmIfaceConfig, SendStatus};
use shm_transport::{AnonShm, DescPoolConfig, HugetlbMode, ShmAllocator, Status};
use worker_runtime::{
    AcceptArg, AcceptHandler, Context, EpHandle, IfaceParams, Listener, ListenerParams,
    LoopbackMd, LoopbackTransport, MemoryDomain, OpenMode, ServerIface, SockaddrAccess,
    SockaddrTransport, ThreadMode, TlResource, Worker, WorkerConfig, WorkerError, WorkerResult,
    LISTENER_PARAM_FIELD_CALLBACK, LISTENER_PARAM_FIELD_SOCK_ADDR,
};

fn addr(s: &str) -> SocketAddr {
    s.parse().expect("socket address")
}

fn loopback_resource(md_name: &str) -> (TlResource, Arc<LoopbackTransport>) {
    let transport = Arc::new(LoopbackTransport::new());
    let resource = TlResource {
        md: Arc::new(LoopbackMd::new(md_name)),
        transport: transport.clone(),
    };
    (resource, transport)
}

fn worker_with(resources: Vec<TlResource>, depth: usize) -> Worker {
    Worker::new(
        Arc::new(Context::new(resources)),
        WorkerConfig {
            thread_mode: ThreadMode::Single,
            progress_queue_depth: depth,
        },
    )
    .expect("create worker")
}

fn counting_params(listen: SocketAddr) -> (ListenerParams, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let arg: AcceptArg = hits.clone();
    let params = ListenerParams::new(listen).with_accept_handler(
        |ep: EpHandle, arg: &AcceptArg| {
            assert!(!ep.is_constructed());
            let hits = arg
                .downcast_ref::<AtomicUsize>()
                .expect("accept arg is the hit counter");
            hits.fetch_add(1, Ordering::SeqCst);
        },
        arg,
    );
    (params, hits)
}

/// A memory domain that cannot resolve socket addresses at all.
struct PlainMd;

impl MemoryDomain for PlainMd {
    fn name(&self) -> &str {
        "plain"
    }

    fn flags(&self) -> u64 {
        0
    }

    fn is_sockaddr_accessible(&self, _addr: &SocketAddr, _mode: SockaddrAccess) -> bool {
        true
    }
}

/// A transport whose server interfaces never open.
#[derive(Default)]
struct FailingTransport {
    attempts: AtomicUsize,
}

impl SockaddrTransport for FailingTransport {
    fn name(&self) -> &str {
        "failing"
    }

    fn open_server(&self, _params: IfaceParams) -> WorkerResult<Box<dyn ServerIface>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(WorkerError::NoMemory("server interface"))
    }
}

/// A transport that raises a connection request while its server is still
/// being opened.
#[derive(Default)]
struct EagerTransport {
    request_ran: Arc<AtomicBool>,
    ran_before_open_returned: AtomicBool,
}

struct FixedServer(SocketAddr);

impl ServerIface for FixedServer {
    fn listen_addr(&self) -> SocketAddr {
        self.0
    }
}

impl SockaddrTransport for EagerTransport {
    fn name(&self) -> &str {
        "eager"
    }

    fn open_server(&self, params: IfaceParams) -> WorkerResult<Box<dyn ServerIface>> {
        let OpenMode::SockaddrServer {
            listen_sockaddr,
            conn_request,
            ..
        } = params.open_mode;
        let ran = Arc::clone(&self.request_ran);
        params.async_ctx.deliver(move || {
            ran.store(true, Ordering::SeqCst);
            let _ = conn_request(b"early");
        });
        self.ran_before_open_returned
            .store(self.request_ran.load(Ordering::SeqCst), Ordering::SeqCst);
        Ok(Box::new(FixedServer(listen_sockaddr)))
    }
}

#[test]
fn zero_resources_is_invalid_addr() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let worker = worker_with(Vec::new(), 16);
    let err = Listener::open(&worker, ListenerParams::new(addr("127.0.0.1:7000"))).unwrap_err();
    assert!(matches!(err, WorkerError::InvalidAddr { .. }));
    assert_eq!(err.status(), Status::InvalidAddr);
}

#[test]
fn unsupported_address_opens_nothing() {
    let (resource, transport) = loopback_resource("lo");
    let worker = worker_with(vec![resource], 16);
    let err = Listener::open(&worker, ListenerParams::new(addr("192.0.2.10:7000"))).unwrap_err();
    assert_eq!(err.status(), Status::InvalidAddr);
    assert_eq!(transport.open_count(), 0);
    assert_eq!(transport.listening(), 0);
}

#[test]
fn first_capable_resource_wins() {
    let (second, second_transport) = loopback_resource("lo-b");
    let (third, third_transport) = loopback_resource("lo-c");
    let plain = TlResource {
        md: Arc::new(PlainMd),
        transport: Arc::new(FailingTransport::default()),
    };
    let worker = worker_with(vec![plain, second, third], 16);

    let listener = Listener::open(&worker, ListenerParams::new(addr("127.0.0.1:7001")))
        .expect("open listener");
    assert_eq!(listener.md_name(), "lo-b");
    assert_eq!(listener.listen_addr(), addr("127.0.0.1:7001"));
    assert_eq!(second_transport.open_count(), 1);
    assert_eq!(third_transport.open_count(), 0);
    listener.close(&worker);
    assert_eq!(second_transport.listening(), 0);
}

#[test]
fn missing_sockaddr_field_is_invalid_param() {
    let (resource, transport) = loopback_resource("lo");
    let worker = worker_with(vec![resource], 16);

    let params = ListenerParams {
        field_mask: 0,
        sockaddr: Some(addr("127.0.0.1:7002")),
        accept_handler: AcceptHandler::default(),
    };
    let err = Listener::open(&worker, params).unwrap_err();
    assert_eq!(err.status(), Status::InvalidParam);

    let params = ListenerParams {
        field_mask: LISTENER_PARAM_FIELD_SOCK_ADDR,
        sockaddr: None,
        accept_handler: AcceptHandler::default(),
    };
    let err = Listener::open(&worker, params).unwrap_err();
    assert_eq!(err.status(), Status::InvalidParam);
    assert_eq!(transport.open_count(), 0);
}

#[test]
fn callback_field_without_callback_is_invalid_param() {
    let (resource, transport) = loopback_resource("lo");
    let worker = worker_with(vec![resource], 16);
    let params = ListenerParams {
        field_mask: LISTENER_PARAM_FIELD_SOCK_ADDR | LISTENER_PARAM_FIELD_CALLBACK,
        sockaddr: Some(addr("127.0.0.1:7003")),
        accept_handler: AcceptHandler::default(),
    };
    let err = Listener::open(&worker, params).unwrap_err();
    assert_eq!(err.status(), Status::InvalidParam);
    assert_eq!(transport.open_count(), 0);
}

#[test]
fn failed_interface_open_rolls_back() {
    let failing = Arc::new(FailingTransport::default());
    let resource = TlResource {
        md: Arc::new(LoopbackMd::new("lo")),
        transport: failing.clone(),
    };
    let worker = worker_with(vec![resource], 16);
    let (params, hits) = counting_params(addr("127.0.0.1:7004"));
    let err = Listener::open(&worker, params).unwrap_err();
    assert_eq!(err.status(), Status::NoMemory);
    assert_eq!(failing.attempts.load(Ordering::SeqCst), 1);
    assert_eq!(Arc::strong_count(&hits), 1, "listener state must be released");
}

#[test]
fn listener_without_callback_accepts_silently() {
    let (resource, transport) = loopback_resource("lo");
    let worker = worker_with(vec![resource], 16);
    let listen = addr("127.0.0.1:7005");
    let listener = Listener::open(&worker, ListenerParams::new(listen)).expect("open");
    assert!(!listener.has_accept_callback());

    transport.connect(&listen, b"hello").expect("connect");
    assert!(worker.callbackq().is_empty());
    assert_eq!(worker.progress().unwrap(), 0);
    listener.close(&worker);
}

#[test]
fn accept_callback_runs_once_and_only_from_progress() {
    let (resource, transport) = loopback_resource("lo");
    let worker = worker_with(vec![resource], 16);
    let listen = addr("127.0.0.1:7006");
    let (params, hits) = counting_params(listen);
    let listener = Listener::open(&worker, params).expect("open");

    transport.connect(&listen, b"one").expect("connect");
    transport.connect(&listen, b"two").expect("connect");
    assert_eq!(hits.load(Ordering::SeqCst), 0, "callback must wait for progress");
    assert_eq!(worker.callbackq().len(), 2);

    assert_eq!(worker.progress().unwrap(), 2);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert_eq!(worker.progress().unwrap(), 0);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    listener.close(&worker);
}

#[test]
fn connection_from_another_thread_is_accepted_on_progress() {
    let (resource, transport) = loopback_resource("lo");
    let worker = worker_with(vec![resource], 64);
    let listen = addr("127.0.0.1:7007");
    let (params, hits) = counting_params(listen);
    let listener = Listener::open(&worker, params).expect("open");

    let remote = Arc::clone(&transport);
    thread::spawn(move || {
        for _ in 0..10 {
            remote.connect(&listen, b"remote").expect("connect");
        }
    })
    .join()
    .expect("connector thread");

    assert_eq!(hits.load(Ordering::SeqCst), 0);
    while worker.progress().unwrap() > 0 {}
    assert_eq!(hits.load(Ordering::SeqCst), 10);
    listener.close(&worker);
}

#[test]
fn full_progress_queue_drops_connection() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let (resource, transport) = loopback_resource("lo");
    let worker = worker_with(vec![resource], 1);
    let listen = addr("127.0.0.1:7008");
    let (params, hits) = counting_params(listen);
    let listener = Listener::open(&worker, params).expect("open");

    transport.connect(&listen, b"kept").expect("connect");
    // The second request finds the queue full; it is logged and dropped.
    transport.connect(&listen, b"dropped").expect("connect");
    assert_eq!(worker.callbackq().len(), 1);

    worker.progress().unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    listener.close(&worker);
}

#[test]
fn requests_during_blocked_async_are_delivered_on_unblock() {
    let (resource, transport) = loopback_resource("lo");
    let worker = worker_with(vec![resource], 16);
    let listen = addr("127.0.0.1:7009");
    let (params, hits) = counting_params(listen);
    let listener = Listener::open(&worker, params).expect("open");

    {
        let _blocked = worker.async_ctx().block();
        transport.connect(&listen, b"parked").expect("connect");
        assert_eq!(worker.async_ctx().missed_count(), 1);
        assert!(worker.callbackq().is_empty());
    }
    assert_eq!(worker.callbackq().len(), 1);
    worker.progress().unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    listener.close(&worker);
}

#[test]
fn request_raised_during_open_waits_for_the_listener() {
    let transport = Arc::new(EagerTransport::default());
    let resource = TlResource {
        md: Arc::new(LoopbackMd::new("lo")),
        transport: transport.clone(),
    };
    let worker = worker_with(vec![resource], 16);
    let (params, hits) = counting_params(addr("127.0.0.1:7013"));

    let listener = Listener::open(&worker, params).expect("open");
    assert!(!transport.ran_before_open_returned.load(Ordering::SeqCst));
    assert!(transport.request_ran.load(Ordering::SeqCst));
    assert!(!worker.async_ctx().is_blocked());
    assert_eq!(worker.callbackq().len(), 1);

    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert_eq!(worker.progress().unwrap(), 1);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    listener.close(&worker);
}

#[test]
fn closed_listener_skips_pending_accepts() {
    let (resource, transport) = loopback_resource("lo");
    let worker = worker_with(vec![resource], 16);
    let listen = addr("127.0.0.1:7010");
    let (params, hits) = counting_params(listen);
    let listener = Listener::open(&worker, params).expect("open");

    transport.connect(&listen, b"late").expect("connect");
    listener.close(&worker);
    assert_eq!(transport.listening(), 0);

    assert_eq!(worker.progress().unwrap(), 1, "the task still runs once");
    assert_eq!(hits.load(Ordering::SeqCst), 0, "but finds no listener");
    assert!(transport.connect(&listen, b"gone").is_err());
}

#[test]
fn listener_can_be_closed_from_its_own_callback() {
    let (resource, transport) = loopback_resource("lo");
    let worker = Arc::new(
        Worker::new(
            Arc::new(Context::new(vec![resource])),
            WorkerConfig {
                thread_mode: ThreadMode::Multi,
                progress_queue_depth: 16,
            },
        )
        .expect("create worker"),
    );
    let listen = addr("127.0.0.1:7011");
    let slot: Arc<parking_lot::Mutex<Option<Listener>>> = Arc::new(parking_lot::Mutex::new(None));

    let closer_worker = Arc::downgrade(&worker);
    let closer_slot = Arc::clone(&slot);
    let arg: AcceptArg = Arc::new(());
    let params = ListenerParams::new(listen).with_accept_handler(
        move |_ep, _arg| {
            let taken = closer_slot.lock().take();
            if let (Some(listener), Some(worker)) = (taken, closer_worker.upgrade()) {
                listener.close(&worker);
            }
        },
        arg,
    );
    *slot.lock() = Some(Listener::open(&worker, params).expect("open"));

    transport.connect(&listen, b"bye").expect("connect");
    worker.progress().unwrap();
    assert!(slot.lock().is_none());
    assert_eq!(transport.listening(), 0);
}

#[test]
fn same_address_cannot_be_opened_twice() {
    let (resource, transport) = loopback_resource("lo");
    let worker = worker_with(vec![resource], 16);
    let listen = addr("127.0.0.1:7012");
    let first = Listener::open(&worker, ListenerParams::new(listen)).expect("open");
    let err = Listener::open(&worker, ListenerParams::new(listen)).unwrap_err();
    assert_eq!(err.status(), Status::InvalidAddr);
    assert_eq!(transport.open_count(), 1);
    first.close(&worker);
}

#[test]
fn worker_progress_drives_fifo_interfaces() {
    let worker = worker_with(Vec::new(), 16);
    let alloc: Arc<dyn ShmAllocator> = Arc::new(AnonShm::new());
    let config = MmIfaceConfig {
        fifo_size: 8,
        fifo_elem_size: 64,
        release_fifo_factor: 0.0,
        hugetlb_mode: HugetlbMode::Never,
        mp: DescPoolConfig {
            seg_size: 64,
            max_bufs: 4,
        },
    };
    let mut iface = MmIface::open(Arc::clone(&alloc), config).expect("open iface");
    let received = Arc::new(AtomicUsize::new(0));
    let sink = Arc::clone(&received);
    iface.set_am_handler(
        5,
        AmHandler::callback(move |payload| {
            sink.fetch_add(payload.len(), Ordering::SeqCst);
            mm_iface::AmStatus::Handled
        }),
    );
    let mut ep = MmEp::connect(alloc.as_ref(), &iface.address()).expect("connect");
    worker.register_engine(iface);

    for _ in 0..3 {
        assert_eq!(ep.send(5, b"abcd").unwrap(), SendStatus::Ok);
    }
    assert_eq!(worker.progress().unwrap(), 3);
    assert_eq!(received.load(Ordering::SeqCst), 12);
    assert_eq!(worker.progress().unwrap(), 0);
}
