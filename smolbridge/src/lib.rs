#![cfg_attr(docsrs, feature(doc_cfg))]

//! # smolbridge - sockets and buffer ownership on top of smoltcp
//!
//! smolbridge drives a user-space TCP/IP stack ([smoltcp]) over an in-process
//! virtual interface, a TUN device or a TAP device, and exposes it through
//! opaque socket handles and an explicit buffer ownership contract. It is
//! built to be called across a language boundary (see the `ffi` feature), but
//! is just as usable from Rust.
//!
//! ## Features
//! - **Stable handles**: non-zero, increasing, never reused.
//! - **Zero-copy sends**: a [`SendToken`] carries the caller's bytes into the
//!   engine and runs its release exactly once when they are no longer needed.
//! - **Caller-chosen receive memory**: every delivered payload is copied once
//!   into a region from an [`Allocator`] and handed out as a [`Buffer`].
//! - **Explicit scheduling**: nothing runs unless [`Stack::poll`] and
//!   [`Stack::spin_all`] (or a [`Scheduler`]) are called.
//!
//! ## Platform support
//!
//! | Medium       | Platform        |
//! |--------------|-----------------|
//! | Virtual TUN  | All             |
//! | TUN / TAP    | Linux, Android  |
//!
//! ## Quick Start
//!
//! ```rust
//! use std::net::{IpAddr, Ipv4Addr};
//! use smolbridge::{
//!   Config, Endpoint, SocketKind, Stack, addr::Ipv4Cidr, engine::DummyEngine,
//! };
//!
//! let engine = DummyEngine::new()
//!   .with_responder(|_, request| Some(format!("echo {}", request.len()).into_bytes()));
//! let mut stack = Stack::with_engine("quick", engine, Config::default());
//!
//! stack.add_ipv4_address(Ipv4Cidr::new(Ipv4Addr::new(192, 168, 69, 1), 24))?;
//! stack.add_default_v4_gateway(Ipv4Addr::new(192, 168, 69, 100))?;
//! let tcp = stack.add_socket(SocketKind::Tcp)?;
//! stack.finalize()?;
//!
//! let port = stack.random_output_port();
//! stack.connect(tcp, IpAddr::V4(Ipv4Addr::new(172, 217, 28, 238)), port, 80)?;
//! stack.poll()?;
//! stack.send_copy(tcp, b"GET / HTTP/1.1\r\n\r\n", Endpoint::None)?;
//! stack.spin_all()?;
//!
//! let reply = stack.receive(tcp)?.expect("responder answered");
//! assert_eq!(&*reply, b"echo 18");
//! # Ok::<(), smolbridge::Error>(())
//! ```
//!
//! ## Error Handling
//!
//! Engines answer with one-byte [`Status`] codes. The [`Stack`] maps them to
//! [`Error`]; [`Error::code`] gives the stable code used across the C ABI.
//!
//! [smoltcp]: https://docs.rs/smoltcp

pub mod addr;
pub mod bridge;
pub mod config;
pub mod engine;
pub mod error;
#[cfg(feature = "ffi")]
#[cfg_attr(docsrs, doc(cfg(feature = "ffi")))]
pub mod ffi;
pub mod handle;
pub mod scheduler;
pub mod socket;
pub mod stack;
pub mod sync;

pub use addr::Endpoint;
pub use bridge::{Allocator, Buffer, Payload, SendToken};
pub use config::{Config, QueuePolicy};
pub use engine::SocketKind;
pub use error::{Error, Result, Status};
pub use handle::SocketHandle;
pub use scheduler::Scheduler;
pub use stack::{InterfaceKind, Stack, State};
