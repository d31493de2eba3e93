//! WebSocket to Redis pub/sub gateway.
//!
//! A single-process server that upgrades TCP (optionally TLS) connections to
//! WebSocket per [RFC 6455], bridges JSON envelopes on each socket to a Redis
//! PUBLISH/SUBSCRIBE back end, and fans Redis subscription messages back out
//! to every subscribed socket.
//!
//! The crate is organised as a set of small protocol layers, leaves first:
//! [`lexer`] drives [`http`], which drives the [`protocol`] handshake;
//! [`codec`] decodes and encodes [`frame`]s once a connection is upgraded;
//! [`pubsub`] owns the channel/socket fan-out tables over the [`pool`]
//! interner, with [`redis_link`] providing the two Redis connections behind
//! it. [`connection`] and [`server`] tie the layers to sockets.
//!
//! [RFC 6455]: https://datatracker.ietf.org/doc/html/rfc6455

/// gateway error definitions
pub mod errors;

/// byte cursor shared by the http parser
pub mod lexer;

/// http/1.1 request reader & response writer
pub mod http;

/// websocket opening handshake
pub mod protocol;

/// websocket transport unit
pub mod frame;

/// frame codec impl
pub mod codec;

/// ref-counted string interner
pub mod pool;

/// client & server json envelopes
pub mod envelope;

/// channel <-> socket fan-out tables
pub mod pubsub;

/// redis publish/subscribe connections
pub mod redis_link;

/// per-socket lifecycle
pub mod connection;

/// accept loop & shutdown
pub mod server;

/// stream definition
pub mod stream;

/// command line configuration
pub mod config;
