//! A Port Control Protocol (RFC 6887) server that programs an OpenFlow 1.3
//! forwarder to perform the NAT translation it negotiates.
//!
//! The OpenFlow session transport (the hello/features handshake, message
//! framing, and the socket itself) is out of scope for this crate; it
//! lives behind the [`forwarder::ForwarderChannel`] trait in an integration
//! crate that feeds this controller [`forwarder::ForwarderEvent`]s and
//! carries out the [`forwarder::FlowEntry`]/packet-out calls it makes in
//! response.

pub mod arp;
pub mod config;
pub mod controller;
pub mod forwarder;
pub mod openflow;
pub mod packet;
pub mod pcp_server;
pub mod programmer;

pub use config::Config;
pub use controller::Controller;
