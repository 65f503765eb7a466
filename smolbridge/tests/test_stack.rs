use std::{
  collections::HashMap,
  net::{IpAddr, Ipv4Addr},
  ops::ControlFlow,
  ptr::NonNull,
  sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
  },
  time::{Duration, Instant},
};

use proptest::prelude::*;
use smolbridge::{
  Allocator, Config, Endpoint, Error, Scheduler, SendToken, SocketHandle,
  SocketKind, Stack, State, Status,
  addr::Ipv4Cidr,
  bridge::HeapAllocator,
  engine::{DummyEngine, DummyProbe},
  error::Op,
};

const LOCAL: Ipv4Addr = Ipv4Addr::new(192, 168, 69, 1);
const GATEWAY: Ipv4Addr = Ipv4Addr::new(192, 168, 69, 100);
const SERVER: IpAddr = IpAddr::V4(Ipv4Addr::new(172, 217, 28, 238));
const REQUEST: &[u8] = b"GET / HTTP/1.1\r\nHost: 172.217.28.238\r\nConnection: close\r\n\r\n";

/// Counts every region and fails on double or foreign release.
#[derive(Default)]
struct CountingAllocator {
  allocations: AtomicUsize,
  releases: AtomicUsize,
  live: Mutex<HashMap<usize, usize>>,
}

unsafe impl Allocator for CountingAllocator {
  fn allocate(&self, len: usize) -> Option<NonNull<u8>> {
    // over-allocate so zero-length regions get distinct addresses
    let ptr = HeapAllocator.allocate(len + 1)?;
    self.allocations.fetch_add(1, Ordering::SeqCst);
    let prev = self.live.lock().unwrap().insert(ptr.as_ptr() as usize, len);
    assert!(prev.is_none(), "allocator returned a live region");
    Some(ptr)
  }

  unsafe fn release(&self, ptr: NonNull<u8>, len: usize) {
    self.releases.fetch_add(1, Ordering::SeqCst);
    let known = self.live.lock().unwrap().remove(&(ptr.as_ptr() as usize));
    assert_eq!(known, Some(len), "double or foreign release");
    unsafe { HeapAllocator.release(ptr, len + 1) };
  }
}

impl CountingAllocator {
  fn live(&self) -> usize {
    self.live.lock().unwrap().len()
  }
}

fn http_engine() -> DummyEngine {
  DummyEngine::new().with_handshake_polls(2).with_responder(|_, request| {
    request
      .starts_with(b"GET /")
      .then(|| b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok".to_vec())
  })
}

fn configured(engine: DummyEngine, config: Config) -> (Stack, DummyProbe) {
  let probe = engine.probe();
  let mut stack = Stack::with_engine("it", engine, config);
  stack.add_ipv4_address(Ipv4Cidr::new(LOCAL, 24)).unwrap();
  stack.add_default_v4_gateway(GATEWAY).unwrap();
  (stack, probe)
}

fn counted(counter: &Arc<AtomicUsize>, data: &'static [u8]) -> SendToken {
  let counter = counter.clone();
  SendToken::with_release(data, move || {
    counter.fetch_add(1, Ordering::SeqCst);
  })
}

#[test]
fn test_http_get_end_to_end() {
  let (mut stack, probe) = configured(http_engine(), Config::default());
  let tcp = stack.add_socket(SocketKind::Tcp).unwrap();
  stack.finalize().unwrap();

  let port = stack.random_output_port();
  assert!(port >= 49152);
  stack.connect(tcp, SERVER, port, 80).unwrap();
  stack.send_copy(tcp, REQUEST, Endpoint::None).unwrap();

  let mut reply = None;
  for _ in 0..16 {
    stack.poll().unwrap();
    stack.spin(tcp).unwrap();
    if let Some(buffer) = stack.receive(tcp).unwrap() {
      reply = Some(buffer);
      break;
    }
  }

  let reply = reply.expect("no reply after 16 cycles");
  assert!(!reply.is_empty());
  assert!(reply.starts_with(b"HTTP/1.1 200 OK"));
  assert_eq!(probe.transmitted(), vec![(tcp, REQUEST.to_vec())]);

  let descriptor = stack.descriptor(tcp).unwrap();
  assert_eq!(descriptor.bytes_sent, REQUEST.len() as u64);
  assert_eq!(descriptor.bytes_received, reply.len() as u64);
  assert_eq!(descriptor.local_port, Some(port));
}

#[test]
fn test_http_get_with_scheduler() {
  let (mut stack, _) = configured(http_engine(), Config::default());
  let tcp = stack.add_socket(SocketKind::Tcp).unwrap();
  stack.finalize().unwrap();
  stack.connect(tcp, SERVER, 0, 80).unwrap();

  let mut sent = false;
  let deadline = Instant::now() + Duration::from_secs(5);
  let reply = Scheduler::new(&mut stack)
    .run_until(deadline, |stack| {
      if !sent && stack.may_send(tcp)? {
        stack.send(tcp, SendToken::new(REQUEST), Endpoint::None)?;
        sent = true;
      }
      Ok(match stack.receive(tcp)? {
        Some(reply) => ControlFlow::Break(reply),
        None => ControlFlow::Continue(()),
      })
    })
    .unwrap();

  assert!(reply.ends_with(b"ok"));
}

#[test]
fn test_add_socket_refused_after_failed_finalize() {
  let (mut stack, probe) = configured(
    DummyEngine::new().failing_finalize(Status::DEVICE),
    Config::default(),
  );
  let before = stack.add_socket(SocketKind::Tcp).unwrap();

  match stack.finalize() {
    Err(Error::EngineRejected { op: Op::Finalize, status }) => {
      assert_eq!(status, Status::DEVICE);
      assert_ne!(status.code(), 0);
    }
    other => panic!("unexpected finalize result: {other:?}"),
  }
  assert_eq!(stack.state(), State::Failed);

  assert!(matches!(
    stack.add_socket(SocketKind::Tcp),
    Err(Error::ConfigurationFinalized)
  ));
  assert!(matches!(stack.poll(), Err(Error::NotRunning)));
  assert_eq!(stack.handles(), vec![before]);
  assert!(probe.is_registered(before));
}

#[test]
fn test_configuration_unchanged_after_finalize() {
  let (mut stack, probe) = configured(DummyEngine::new(), Config::default());
  stack.finalize().unwrap();

  let extra = Ipv4Cidr::new(Ipv4Addr::new(10, 1, 0, 1), 16);
  assert!(matches!(
    stack.add_ipv4_address(extra),
    Err(Error::ConfigurationFinalized)
  ));
  assert!(matches!(
    stack.add_ipv6_address(smolbridge::addr::Ipv6Cidr::new(
      "fe80::1".parse().unwrap(),
      64
    )),
    Err(Error::ConfigurationFinalized)
  ));
  assert!(matches!(
    stack.add_default_v6_gateway("fe80::2".parse().unwrap()),
    Err(Error::ConfigurationFinalized)
  ));
  assert_eq!(probe.addresses(), (1, 0));
}

#[test]
fn test_lookup_soundness() {
  assert!(SocketHandle::from_raw(0).is_none());

  let (mut stack, _) = configured(DummyEngine::new(), Config::default());
  let a = stack.add_socket(SocketKind::Udp).unwrap();
  let b = stack.add_socket(SocketKind::Udp).unwrap();
  stack.finalize().unwrap();

  assert!(stack.descriptor(a).is_ok());
  stack.close(a).unwrap();
  assert!(matches!(stack.descriptor(a), Err(Error::InvalidHandle(h)) if h == a));
  assert!(matches!(stack.may_send(a), Err(Error::InvalidHandle(_))));

  // never issued: same slot as `b`, later serial
  let forged = SocketHandle::from_raw(b.as_raw() + (1 << 32)).unwrap();
  assert!(matches!(stack.receive(forged), Err(Error::InvalidHandle(_))));

  stack.destroy();
  assert!(matches!(stack.descriptor(b), Err(Error::InvalidHandle(_))));
}

#[test]
fn test_receive_does_not_block() {
  let (mut stack, probe) = configured(DummyEngine::new(), Config::default());
  let udp = stack.add_socket(SocketKind::Udp).unwrap();
  stack.bind(udp, 5353).unwrap();
  stack.finalize().unwrap();

  let start = Instant::now();
  assert!(stack.receive(udp).unwrap().is_none());
  assert!(stack.receive_wait(udp).unwrap().is_none());
  assert!(start.elapsed() < Duration::from_secs(1));

  let from = Endpoint::new(SERVER, 53);
  probe.deliver(udp, b"answer", from);
  let (buffer, source) = stack.receive_wait(udp).unwrap().unwrap();
  assert_eq!(&*buffer, b"answer");
  assert_eq!(source, from);
}

#[test]
fn test_token_released_after_send_and_once() {
  let (mut stack, _) = configured(
    DummyEngine::new().with_handshake_polls(0),
    Config::default(),
  );
  let tcp = stack.add_socket(SocketKind::Tcp).unwrap();
  stack.finalize().unwrap();
  stack.connect(tcp, SERVER, 0, 80).unwrap();

  let released = Arc::new(AtomicUsize::new(0));
  let token = counted(&released, REQUEST);
  assert_eq!(released.load(Ordering::SeqCst), 0);

  stack.send(tcp, token, Endpoint::None).unwrap();
  // queued, not yet transmitted
  assert_eq!(released.load(Ordering::SeqCst), 0);

  stack.spin_all().unwrap();
  assert_eq!(released.load(Ordering::SeqCst), 1);

  for _ in 0..4 {
    stack.poll().unwrap();
    stack.spin_all().unwrap();
  }
  assert_eq!(released.load(Ordering::SeqCst), 1);
}

#[test]
fn test_rejected_send_releases_token() {
  let (mut stack, _) = configured(DummyEngine::new(), Config::default());
  let tcp = stack.add_socket(SocketKind::Tcp).unwrap();
  stack.finalize().unwrap();

  let released = Arc::new(AtomicUsize::new(0));
  let err = stack
    .send(tcp, counted(&released, REQUEST), Endpoint::None)
    .unwrap_err();

  assert!(matches!(
    err,
    Error::EngineRejected { op: Op::Send, status: Status::INVALID_STATE }
  ));
  assert_eq!(released.load(Ordering::SeqCst), 1);
}

#[test]
fn test_full_send_queue_would_block() {
  let (mut stack, _) = configured(
    DummyEngine::new().with_handshake_polls(0).with_send_capacity(1),
    Config::default(),
  );
  let tcp = stack.add_socket(SocketKind::Tcp).unwrap();
  stack.finalize().unwrap();
  stack.connect(tcp, SERVER, 0, 80).unwrap();

  stack.send_copy(tcp, b"first", Endpoint::None).unwrap();
  assert!(!stack.may_send(tcp).unwrap());
  let err = stack.send_copy(tcp, b"second", Endpoint::None).unwrap_err();
  assert!(err.is_would_block());
  assert_eq!(err.code(), Status::WOULD_BLOCK.code());

  stack.spin(tcp).unwrap();
  assert!(stack.may_send(tcp).unwrap());
}

#[test]
fn test_teardown_releases_everything_once() {
  let alloc = Arc::new(CountingAllocator::default());
  let released = Arc::new(AtomicUsize::new(0));

  // the handshake never completes, so sends stay queued in the engine
  let (mut stack, probe) = configured(
    DummyEngine::new().with_handshake_polls(100),
    Config::default(),
  );
  stack.set_allocator(alloc.clone());
  let tcp = stack.add_socket(SocketKind::Tcp).unwrap();
  let udp = stack.add_socket(SocketKind::Udp).unwrap();
  stack.bind(udp, 4000).unwrap();
  stack.finalize().unwrap();
  stack.connect(tcp, SERVER, 0, 80).unwrap();

  for _ in 0..3 {
    stack.send(tcp, counted(&released, b"q"), Endpoint::None).unwrap();
  }
  let from = Endpoint::new(SERVER, 53);
  probe.deliver(udp, b"a1", from);
  probe.deliver(udp, b"a2", from);
  stack.poll().unwrap();
  stack.spin_all().unwrap();

  assert_eq!(stack.descriptor(udp).unwrap().inbox.len(), 2);
  assert_eq!(alloc.allocations.load(Ordering::SeqCst), 2);
  assert_eq!(released.load(Ordering::SeqCst), 0);
  assert_eq!(probe.queued(), 3);

  drop(stack);
  assert_eq!(released.load(Ordering::SeqCst), 3);
  assert_eq!(alloc.releases.load(Ordering::SeqCst), 2);
  assert_eq!(alloc.live(), 0);
}

proptest! {
  #[test]
  fn prop_handles_distinct_and_increasing(ops in prop::collection::vec(any::<bool>(), 1..64)) {
    let mut stack = Stack::with_engine("prop", DummyEngine::new(), Config::default());
    let mut issued: Vec<SocketHandle> = Vec::new();
    let mut live: Vec<SocketHandle> = Vec::new();

    for close in ops {
      if close && !live.is_empty() {
        let victim = live.remove(0);
        stack.close(victim).unwrap();
      } else {
        let handle = stack.add_socket(SocketKind::Udp).unwrap();
        if let Some(last) = issued.last() {
          prop_assert!(handle > *last);
        }
        prop_assert_ne!(handle.as_raw(), 0);
        issued.push(handle);
        live.push(handle);
      }
    }

    prop_assert_eq!(stack.handles(), live);
  }

  #[test]
  fn prop_each_delivery_allocated_and_released_once(
    payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 0..48),
    inbox in 1usize..8,
    drop_oldest in any::<bool>(),
  ) {
    let alloc = Arc::new(CountingAllocator::default());
    let policy = if drop_oldest {
      smolbridge::QueuePolicy::DropOldest
    } else {
      smolbridge::QueuePolicy::Reject
    };
    let engine = DummyEngine::new();
    let probe = engine.probe();
    let mut stack = Stack::with_engine(
      "prop",
      engine,
      Config::default().with_inbox_capacity(inbox).with_queue_policy(policy),
    );
    stack.set_allocator(alloc.clone());
    let udp = stack.add_socket(SocketKind::Udp).unwrap();
    stack.bind(udp, 4000).unwrap();
    stack.finalize().unwrap();

    for payload in &payloads {
      probe.deliver(udp, payload, Endpoint::None);
    }

    let mut received = 0;
    stack.spin(udp).unwrap();
    while let Some(buffer) = stack.receive(udp).unwrap() {
      received += 1;
      drop(buffer);
      stack.spin(udp).unwrap();
    }

    let n = payloads.len();
    prop_assert_eq!(alloc.allocations.load(Ordering::SeqCst), n);
    prop_assert_eq!(alloc.releases.load(Ordering::SeqCst), n);
    prop_assert_eq!(alloc.live(), 0);
    let dropped = stack.descriptor(udp).unwrap().inbox.dropped() as usize;
    prop_assert_eq!(received + dropped, n);
  }
}
