//! The isolated interpreter pool.
//!
//! Script verification runs in worker OS processes so a misbehaving
//! script cannot corrupt the host or a subsequent job. The host side
//! ([`supervisor`]) owns the worker children, dispatches one job per
//! worker, queues overflow strictly FIFO, and restarts workers on exit
//! without ever dropping a caller's pending verdict. The worker side
//! ([`worker`]) is a synchronous frame loop over stdin/stdout speaking
//! the [`protocol`] messages.

pub mod protocol;
pub mod supervisor;
pub mod worker;
