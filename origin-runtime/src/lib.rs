#![warn(rust_2018_idioms)]

//! Cooperative, single-threaded execution for the origin engine.
//!
//! One OS thread runs all session coroutines of a server loop; protocol
//! state machines stay sans-io and this crate owns the sockets, timers and
//! scheduling. Every I/O operation is a suspension point, timeouts surface
//! as [shared::error::Error::ErrTimeout], and cancellation is cooperative
//! via [Interrupt] sentinels polled after each yield.

pub mod breaker;
pub mod cond;
pub mod executor;
pub mod interrupt;
pub mod kbps;
pub mod listener;
pub mod mutex;
pub mod netfd;
pub mod worker;

pub use breaker::{CircuitBreaker, CircuitBreakerConfig, ProcCpuSampler};
pub use cond::Cond;
pub use executor::{io_timeout, spawn, spawn_with_cid, usleep, yield_now, Runtime, NO_TIMEOUT};
pub use interrupt::Interrupt;
pub use kbps::{IoStat, Kbps, NetworkDelta};
pub use mutex::CoMutex;
pub use netfd::{TcpFd, UdpFd};
pub use worker::AsyncCallWorker;
