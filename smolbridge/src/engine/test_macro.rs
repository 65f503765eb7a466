//! Macro for generating Engine conformance tests
//!
//! Every engine must answer the same calls with the same status codes, so the
//! stack can treat them interchangeably. Usage:
//! ```ignore
//! test_engine!(dummy, DummyEngine::new());
//! ```

/// Generates a conformance suite for an [`Engine`](crate::engine::Engine)
/// implementation. `$ctor` is evaluated once per test and must yield a fresh,
/// unfinalized engine.
///
/// Requires `pastey` (a dev-dependency of this crate).
///
/// # Example
/// ```ignore
/// use smolbridge::{Config, engine::SmolEngine, test_engine};
///
/// test_engine!(smol, SmolEngine::virtual_tun(&Config::default()).0);
/// ```
#[macro_export]
macro_rules! test_engine {
  ($name:ident, $ctor:expr) => {
    ::pastey::paste! {
      #[allow(unused_imports)]
      mod [<$name _engine_conformance>] {
        use super::*;
        use std::{
          net::{IpAddr, Ipv4Addr},
          sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
          },
          time::Duration,
        };
        use $crate::{
          Endpoint, SendToken, SocketHandle, Status,
          addr::Ipv4Cidr,
          bridge::heap,
          engine::{Engine, SocketKind},
        };

        fn engine() -> impl Engine {
          $ctor
        }

        fn handle(n: u64) -> SocketHandle {
          SocketHandle::from_raw(n << 32).unwrap()
        }

        fn peer() -> Endpoint {
          Endpoint::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 7)
        }

        fn counted(counter: &Arc<AtomicUsize>) -> SendToken {
          let counter = counter.clone();
          SendToken::with_release(b"conformance".to_vec(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
          })
        }

        fn configured() -> impl Engine {
          let mut engine = engine();
          engine
            .add_ipv4_address(Ipv4Cidr::new(Ipv4Addr::new(10, 0, 0, 1), 24))
            .unwrap();
          engine
        }

        #[test]
        fn test_duplicate_socket_rejected() {
          let mut engine = engine();
          engine.add_socket(handle(1), SocketKind::Tcp).unwrap();
          assert_eq!(
            engine.add_socket(handle(1), SocketKind::Udp),
            Err(Status::DUPLICATE)
          );
        }

        #[test]
        fn test_unknown_handle() {
          let mut engine = engine();
          let h = handle(9);
          assert_eq!(engine.close_socket(h), Err(Status::NO_SOCKET));
          assert_eq!(engine.bind(h, 1000), Err(Status::NO_SOCKET));
          assert_eq!(engine.may_send(h), Err(Status::NO_SOCKET));
          assert_eq!(
            engine.send_copy(h, b"x", peer()),
            Err(Status::NO_SOCKET)
          );
          assert_eq!(
            engine.receive(h, &heap()).unwrap_err(),
            Status::NO_SOCKET
          );
        }

        #[test]
        fn test_udp_connect_unsupported() {
          let mut engine = configured();
          engine.add_socket(handle(1), SocketKind::Udp).unwrap();
          engine.finalize(Duration::ZERO).unwrap();
          let remote = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
          assert_eq!(
            engine.connect(handle(1), remote, 49152, 7),
            Err(Status::UNSUPPORTED)
          );
        }

        #[test]
        fn test_tcp_bind_unsupported() {
          let mut engine = engine();
          engine.add_socket(handle(1), SocketKind::Tcp).unwrap();
          assert_eq!(engine.bind(handle(1), 1000), Err(Status::UNSUPPORTED));
        }

        #[test]
        fn test_udp_send_without_endpoint() {
          let mut engine = engine();
          engine.add_socket(handle(1), SocketKind::Udp).unwrap();
          engine.bind(handle(1), 4000).unwrap();
          assert_eq!(
            engine.send_copy(handle(1), b"x", Endpoint::None),
            Err(Status::NO_ENDPOINT)
          );
        }

        #[test]
        fn test_tcp_send_before_connect() {
          let mut engine = configured();
          engine.add_socket(handle(1), SocketKind::Tcp).unwrap();
          engine.finalize(Duration::ZERO).unwrap();
          assert_eq!(
            engine.send_copy(handle(1), b"x", Endpoint::None),
            Err(Status::INVALID_STATE)
          );
        }

        #[test]
        fn test_rejected_send_releases_token() {
          let mut engine = engine();
          let released = Arc::new(AtomicUsize::new(0));
          engine.add_socket(handle(1), SocketKind::Udp).unwrap();

          let result = engine.send(handle(1), counted(&released), Endpoint::None);
          assert_eq!(result, Err(Status::NO_ENDPOINT));
          assert_eq!(released.load(Ordering::SeqCst), 1);
        }

        #[test]
        fn test_finalize_twice() {
          let mut engine = configured();
          engine.finalize(Duration::ZERO).unwrap();
          assert_eq!(
            engine.finalize(Duration::ZERO),
            Err(Status::INVALID_STATE)
          );
        }

        #[test]
        fn test_invalid_prefix() {
          let mut engine = engine();
          engine
            .add_ipv4_address(Ipv4Cidr::new(Ipv4Addr::new(10, 0, 0, 1), 33))
            .unwrap();
          assert_eq!(
            engine.finalize(Duration::ZERO),
            Err(Status::INVALID_CONFIG)
          );
        }

        #[test]
        fn test_not_finalized() {
          let mut engine = engine();
          engine.add_socket(handle(1), SocketKind::Tcp).unwrap();
          let remote = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
          assert_eq!(
            engine.connect(handle(1), remote, 49152, 80),
            Err(Status::INVALID_STATE)
          );
          assert_eq!(engine.poll(Duration::ZERO), Err(Status::INVALID_STATE));
          assert_eq!(engine.spin_all(), Err(Status::INVALID_STATE));
        }

        #[test]
        fn test_close_releases_tokens() {
          let mut engine = engine();
          let released = Arc::new(AtomicUsize::new(0));
          engine.add_socket(handle(1), SocketKind::Udp).unwrap();
          engine.bind(handle(1), 4000).unwrap();
          engine.send(handle(1), counted(&released), peer()).unwrap();

          engine.close_socket(handle(1)).unwrap();
          assert_eq!(released.load(Ordering::SeqCst), 1);
          assert_eq!(engine.close_socket(handle(1)), Err(Status::NO_SOCKET));
        }

        #[test]
        fn test_drop_releases_tokens() {
          let mut engine = engine();
          let released = Arc::new(AtomicUsize::new(0));
          engine.add_socket(handle(1), SocketKind::Udp).unwrap();
          engine.bind(handle(1), 4000).unwrap();
          engine.send(handle(1), counted(&released), peer()).unwrap();
          engine.send(handle(1), counted(&released), peer()).unwrap();

          drop(engine);
          assert_eq!(released.load(Ordering::SeqCst), 2);
        }

        #[test]
        fn test_udp_receive_empty_would_block() {
          let mut engine = engine();
          engine.add_socket(handle(1), SocketKind::Udp).unwrap();
          engine.bind(handle(1), 4000).unwrap();
          assert!(engine.may_send(handle(1)).unwrap());
          assert_eq!(
            engine.receive(handle(1), &heap()).unwrap_err(),
            Status::WOULD_BLOCK
          );
        }

        #[test]
        fn test_extract_without_frames() {
          let mut engine = engine();
          assert_eq!(
            engine.extract_frame(&heap(), None).unwrap_err(),
            Status::WOULD_BLOCK
          );
        }
      }
    }
  };
}
