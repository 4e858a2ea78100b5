//! spindle - a single-threaded epoll reactor for Linux TCP servers.
//!
//! One OS thread owns one [`EventLoop`]; every [`Channel`], [`Connection`],
//! and timer mutation happens on that thread. Foreign threads enter through
//! a [`LoopHandle`], whose tasks are enqueued and woken through an eventfd
//! that the loop watches like any other fd. Idle connections age out of a
//! hashed time wheel driven by a one-second timerfd.
//!
//! Per loop iteration: block in epoll (the only suspension point), dispatch
//! ready channels in kernel order, then drain queued cross-thread tasks.
//!
//! # Quick start
//!
//! ```ignore
//! use spindle::{Config, EventLoop, TcpServer};
//!
//! let lp = EventLoop::new()?;
//! let server = TcpServer::bind(&lp, "127.0.0.1:7000".parse()?, Config::default())?;
//! server.set_message_callback(|conn, input| {
//!     // Echo complete lines back to the peer.
//!     while let Some(line) = input.read_line() {
//!         conn.send(&line);
//!     }
//! });
//! server.start();
//! lp.start()?;
//! ```

pub mod acceptor;
pub mod buffer;
pub mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod event_loop;
mod poller;
pub mod server;
pub mod socket;
mod timer;
pub mod worker;

pub use acceptor::Acceptor;
pub use buffer::Buffer;
pub use channel::{Channel, EventSet};
pub use config::Config;
pub use connection::{ConnRef, Connection, ConnectionState};
pub use error::{Error, Result};
pub use event_loop::{EventLoop, LoopHandle};
pub use server::TcpServer;
pub use socket::Socket;
pub use worker::LoopThread;
