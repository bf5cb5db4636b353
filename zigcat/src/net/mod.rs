//! Networking core: byte buffers, access control, the telnet engine, the
//! chat protocol and the multi-client broker.

pub mod access;
pub mod broker;
pub mod buffer;
pub mod chat;
pub mod flow;
pub mod pool;
pub mod stream;
pub mod telnet;
