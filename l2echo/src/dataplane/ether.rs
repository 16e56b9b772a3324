//! Ethernet header rewrite for the echo path
//!
//! Only the 12-byte address pair is touched; the EtherType and payload are
//! never looked at.

use smoltcp::wire::{EthernetAddress, EthernetFrame};

/// Ethernet header size
pub const ETHERNET_HDR_SIZE: usize = 14;

/// Rewrite a frame so it heads back to its sender, coming from `device_mac`.
///
/// The original source address becomes the destination and the source is
/// replaced by the device address. This is not an address swap: the original
/// destination is discarded. Frames shorter than an Ethernet header are left
/// untouched and `false` is returned.
#[inline]
pub fn mirror(frame: &mut [u8], device_mac: EthernetAddress) -> bool {
    let Ok(mut eth) = EthernetFrame::new_checked(frame) else {
        return false;
    };
    let sender = eth.src_addr();
    eth.set_src_addr(device_mac);
    eth.set_dst_addr(sender);
    true
}
