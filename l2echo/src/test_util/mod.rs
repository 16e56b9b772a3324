//! Test utilities: an in-memory multi-queue port and frame builders

pub mod loopback;
pub mod packets;

pub use loopback::{LOOPBACK_MAC, LoopbackHandle, LoopbackPort};
pub use packets::{FlowSpec, L4, build_ethernet_frame, build_ipv4_frame, build_ipv6_frame};
