//! Kernel readiness-driven I/O multiplexing over kqueue and epoll.
//!
//! This crate multiplexes heterogeneous kernel endpoints (stream sockets,
//! datagram sockets, pipes, files, listeners, and descriptor-passing
//! channels) under one explicit event loop.
//!
//! # Architecture
//!
//! - **Junction**: the cycle engine; owns the channel ring and the kernel
//!   notification handle, and drives `enter`/`exit` cycles
//! - **Channel**: one unidirectional transfer participant carrying a
//!   user-supplied resource buffer
//! - **Port**: kernel descriptor ownership, syscalls, and the last-error
//!   record
//! - **Endpoint**: immutable address values with interface and port
//!   projections
//! - **DatagramArray**: packed `{address, payload}` records for datagram
//!   channels
//!
//! # Example
//!
//! ```no_run
//! use junction::{Junction, Param, Resource};
//!
//! let junction = Junction::new().unwrap();
//! let (input, output) = Junction::rallocate(&["octets", "spawn", "unidirectional"], Param::None)
//!     .unwrap()
//!     .into_pair()
//!     .unwrap();
//!
//! junction.acquire(&input).unwrap();
//! input.acquire(Resource::Octets(vec![0u8; 1024])).unwrap();
//!
//! junction.enter().unwrap();
//! for channel in junction.transfer() {
//!     if let Some(transfer) = channel.transfer() {
//!         // observe the transferred region
//!         let _ = transfer;
//!     }
//! }
//! junction.exit();
//! # drop(output);
//! ```

mod channel;
mod datagram;
mod endpoint;
mod error;
mod junction;
mod port;

pub use channel::{Channel, Resource, Transfer};
pub use datagram::DatagramArray;
pub use endpoint::{Endpoint, Family};
pub use error::Violation;
pub use junction::{Allocation, Junction, Param, Transfers};
pub use port::{Kcall, Kind, Polarity, Port};
