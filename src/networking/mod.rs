#![forbid(unsafe_code)]
#![allow(missing_docs)]

//! Networking: the mainline DHT client, the periodic announcer and peer
//! discovery.

pub mod announcer;
pub mod dht;
pub mod discovery;
pub mod krpc;
pub mod routing;
