//! Linux AF_PACKET port
//!
//! Each queue pair is a pair of non-blocking packet sockets bound to the
//! interface. Receive sockets of one port join a `PACKET_FANOUT_HASH` group,
//! so the kernel's flow hash spreads flows over queues the way RSS does on a
//! multi-queue NIC. Transmit sockets are bound with protocol 0 and never
//! receive anything.
//!
//! Receive sockets are opened with protocol 0 and bound to the interface
//! right away, so they see nothing until `start` rebinds them to `ETH_P_ALL`.
//! An unbound `ETH_P_ALL` socket would pick up frames from every interface.

use std::ffi::CStr;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::libc::{self, c_int, c_void};
use nix::sys::socket::{
    AddressFamily, MsgFlags, SockFlag, SockType, recv, send, setsockopt, socket, sockopt,
};
use smoltcp::wire::EthernetAddress;
use tracing::{debug, info, warn};

use super::buffer::{BufferPool, PoolBuffer, PoolCache};
use super::port::{
    DescLimits, DeviceCapabilities, NetworkPort, PortConf, PortError, PortState, QueuePair,
    RxQueue, TxQueue, check_queue_count, expect_state,
};
use super::rss::RssHashFields;

// linux/if_packet.h
const PACKET_FANOUT: c_int = 18;
const PACKET_IGNORE_OUTGOING: c_int = 23;
const PACKET_FANOUT_HASH: u32 = 0;
const PACKET_FANOUT_FLAG_DEFRAG: u32 = 0x8000;

/// Default fanout group size limit of the kernel
const MAX_FANOUT_MEMBERS: u16 = 256;

/// Socket buffer bytes budgeted per transmit descriptor
const TX_SLOT_BYTES: usize = 2048;

/// Upper bound on frames discarded from one socket at start
const MAX_DRAIN: usize = 1 << 16;

#[derive(Default)]
struct QueueSlot {
    rx: Option<OwnedFd>,
    tx: Option<OwnedFd>,
    pool: Option<&'static BufferPool>,
}

/// A network interface driven through packet sockets
pub struct AfPacketPort {
    /// Interface name or index as given by the user
    ident: String,
    name: String,
    if_index: u32,
    state: PortState,
    conf: Option<PortConf>,
    slots: Vec<QueueSlot>,
    /// Holds the promiscuous membership while open
    control: Option<OwnedFd>,
    fanout_group: u16,
}

impl AfPacketPort {
    /// Refer to an interface by name (`eth0`) or index (`2`).
    ///
    /// Nothing is checked until [`NetworkPort::validate`].
    pub fn new(ident: impl Into<String>) -> Self {
        Self {
            ident: ident.into(),
            name: String::new(),
            if_index: 0,
            state: PortState::Unconfigured,
            conf: None,
            slots: Vec::new(),
            control: None,
            fanout_group: 0,
        }
    }

    fn resolve(ident: &str) -> Result<(String, u32), PortError> {
        if !ident.is_empty() && ident.bytes().all(|b| b.is_ascii_digit()) {
            let index: u32 = ident
                .parse()
                .map_err(|_| PortError::NotFound(ident.to_string()))?;
            let mut buf = [0 as libc::c_char; libc::IF_NAMESIZE];
            let ret = unsafe { libc::if_indextoname(index, buf.as_mut_ptr()) };
            if ret.is_null() {
                return Err(PortError::NotFound(ident.to_string()));
            }
            let name = unsafe { CStr::from_ptr(buf.as_ptr()) }
                .to_string_lossy()
                .into_owned();
            Ok((name, index))
        } else {
            if ident.is_empty() || ident.len() >= libc::IF_NAMESIZE {
                return Err(PortError::NotFound(ident.to_string()));
            }
            let index = nix::net::if_::if_nametoindex(ident)
                .map_err(|_| PortError::NotFound(ident.to_string()))?;
            Ok((ident.to_string(), index))
        }
    }

    fn slot(&mut self, kind: &'static str, queue: u16) -> Result<&mut QueueSlot, PortError> {
        let configured = self.slots.len() as u16;
        self.slots.get_mut(queue as usize).ok_or(PortError::InvalidQueue {
            kind,
            queue,
            configured,
        })
    }
}

/// Interface request with the name filled in
fn ifreq_for(name: &str) -> libc::ifreq {
    let mut ifr: libc::ifreq = unsafe { mem::zeroed() };
    for (dst, src) in ifr.ifr_name.iter_mut().zip(name.bytes()) {
        *dst = src as libc::c_char;
    }
    ifr
}

/// Run an interface ioctl on a throwaway datagram socket
fn if_ioctl(name: &str, request: libc::Ioctl) -> io::Result<libc::ifreq> {
    let sock = socket(
        AddressFamily::Inet,
        SockType::Datagram,
        SockFlag::SOCK_CLOEXEC,
        None,
    )?;
    let mut ifr = ifreq_for(name);
    let ret = unsafe { libc::ioctl(sock.as_raw_fd(), request, &mut ifr) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ifr)
}

/// Read hardware type and address of an interface
fn hw_address(name: &str) -> io::Result<(u16, [u8; 6])> {
    let ifr = if_ioctl(name, libc::SIOCGIFHWADDR)?;
    let sa = unsafe { ifr.ifr_ifru.ifru_hwaddr };
    let mut mac = [0u8; 6];
    for (dst, src) in mac.iter_mut().zip(sa.sa_data.iter()) {
        *dst = *src as u8;
    }
    Ok((sa.sa_family, mac))
}

fn is_up(name: &str) -> io::Result<bool> {
    let ifr = if_ioctl(name, libc::SIOCGIFFLAGS)?;
    let flags = unsafe { ifr.ifr_ifru.ifru_flags };
    Ok(flags as c_int & libc::IFF_UP != 0)
}

/// Packet socket with protocol 0: receives nothing until bound to a protocol
fn packet_socket() -> io::Result<OwnedFd> {
    Ok(socket(
        AddressFamily::Packet,
        SockType::Raw,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        None,
    )?)
}

fn set_packet_opt<T>(fd: &OwnedFd, opt: c_int, val: &T) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            libc::SOL_PACKET,
            opt,
            val as *const T as *const c_void,
            mem::size_of::<T>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Bind a packet socket to an interface, receiving `protocol` (host order)
fn bind_to_interface(fd: &OwnedFd, if_index: u32, protocol: u16) -> io::Result<()> {
    let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
    addr.sll_family = libc::AF_PACKET as u16;
    addr.sll_protocol = protocol.to_be();
    addr.sll_ifindex = if_index as c_int;
    let ret = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Discard frames queued on a socket, returning how many were dropped
fn drain_socket(fd: RawFd) -> usize {
    let mut scratch = [0u8; 64];
    let mut dropped = 0;
    while dropped < MAX_DRAIN
        && recv(fd, &mut scratch, MsgFlags::MSG_DONTWAIT | MsgFlags::MSG_TRUNC).is_ok()
    {
        dropped += 1;
    }
    dropped
}

fn promisc_membership(fd: &OwnedFd, if_index: u32, enable: bool) -> io::Result<()> {
    let mreq = libc::packet_mreq {
        mr_ifindex: if_index as c_int,
        mr_type: libc::PACKET_MR_PROMISC as u16,
        mr_alen: 0,
        mr_address: [0; 8],
    };
    let opt = if enable {
        libc::PACKET_ADD_MEMBERSHIP
    } else {
        libc::PACKET_DROP_MEMBERSHIP
    };
    set_packet_opt(fd, opt, &mreq)
}

impl NetworkPort for AfPacketPort {
    type Rx = AfPacketRx;
    type Tx = AfPacketTx;

    fn id(&self) -> u32 {
        self.if_index
    }

    fn name(&self) -> &str {
        if self.name.is_empty() {
            &self.ident
        } else {
            &self.name
        }
    }

    fn state(&self) -> PortState {
        self.state
    }

    fn validate(&mut self) -> Result<(), PortError> {
        let (name, if_index) = Self::resolve(&self.ident)?;

        let (hw_type, _) = hw_address(&name)?;
        if hw_type != libc::ARPHRD_ETHER {
            return Err(PortError::NotEthernet(name));
        }
        if !is_up(&name)? {
            return Err(PortError::Down(name));
        }

        debug!(name = %name, if_index, "Interface validated");
        self.name = name;
        self.if_index = if_index;
        self.fanout_group = ((std::process::id() ^ if_index) & 0xffff) as u16;
        Ok(())
    }

    fn capabilities(&self) -> Result<DeviceCapabilities, PortError> {
        let desc = DescLimits {
            min: 32,
            max: 32768,
            align: 8,
        };
        Ok(DeviceCapabilities {
            driver: "af_packet",
            max_rx_queues: MAX_FANOUT_MEMBERS,
            max_tx_queues: MAX_FANOUT_MEMBERS,
            // The kernel flow hash always covers addresses and ports
            rss_fields: RssHashFields::ALL,
            rx_desc: desc,
            tx_desc: desc,
        })
    }

    fn configure(&mut self, conf: &PortConf) -> Result<(), PortError> {
        expect_state(
            self.state,
            &[PortState::Unconfigured, PortState::Configured, PortState::Stopped],
            "stopped or unconfigured",
        )?;
        if self.if_index == 0 {
            return Err(PortError::NotFound(self.ident.clone()));
        }
        check_queue_count("rx", conf.rx_queues, MAX_FANOUT_MEMBERS)?;
        check_queue_count("tx", conf.tx_queues, MAX_FANOUT_MEMBERS)?;
        if conf.rx_queues > 1 && conf.rss.fields.is_empty() {
            return Err(PortError::NoRssFields);
        }
        if conf.rss.fields != RssHashFields::ALL {
            info!(
                requested = %conf.rss.fields,
                "Kernel flow hash keys on addresses and ports regardless of requested fields"
            );
        }

        let queues = conf.rx_queues.max(conf.tx_queues) as usize;
        self.slots = (0..queues).map(|_| QueueSlot::default()).collect();
        self.conf = Some(*conf);
        self.state = PortState::Configured;
        Ok(())
    }

    fn setup_rx_queue(
        &mut self,
        queue: u16,
        depth: u16,
        pool: &'static BufferPool,
    ) -> Result<(), PortError> {
        expect_state(self.state, &[PortState::Configured], "configured")?;
        let rx_queues = self.conf.map_or(0, |c| c.rx_queues);
        if queue >= rx_queues {
            return Err(PortError::InvalidQueue {
                kind: "rx",
                queue,
                configured: rx_queues,
            });
        }

        let fd = packet_socket()?;
        bind_to_interface(&fd, self.if_index, 0)?;
        setsockopt(
            &fd,
            sockopt::RcvBuf,
            &(depth as usize).saturating_mul(pool.data_room()),
        )?;
        // Our own transmissions must not come back in as receptions
        set_packet_opt(&fd, PACKET_IGNORE_OUTGOING, &(1 as c_int))?;

        let slot = self.slot("rx", queue)?;
        slot.rx = Some(fd);
        slot.pool = Some(pool);
        debug!(queue, depth, "rx queue set up");
        Ok(())
    }

    fn setup_tx_queue(&mut self, queue: u16, depth: u16) -> Result<(), PortError> {
        expect_state(self.state, &[PortState::Configured], "configured")?;
        let tx_queues = self.conf.map_or(0, |c| c.tx_queues);
        if queue >= tx_queues {
            return Err(PortError::InvalidQueue {
                kind: "tx",
                queue,
                configured: tx_queues,
            });
        }

        let fd = packet_socket()?;
        setsockopt(&fd, sockopt::SndBuf, &(depth as usize * TX_SLOT_BYTES))?;

        self.slot("tx", queue)?.tx = Some(fd);
        debug!(queue, depth, "tx queue set up");
        Ok(())
    }

    fn start(&mut self) -> Result<(), PortError> {
        expect_state(self.state, &[PortState::Configured], "configured")?;
        let conf = self.conf.ok_or(PortError::InvalidState {
            expected: "configured",
            actual: self.state,
        })?;

        for (queue, slot) in self.slots.iter().enumerate() {
            let queue = queue as u16;
            if queue < conf.rx_queues && slot.rx.is_none() {
                return Err(PortError::QueueNotSetUp { kind: "rx", queue });
            }
            if queue < conf.tx_queues && slot.tx.is_none() {
                return Err(PortError::QueueNotSetUp { kind: "tx", queue });
            }
        }

        let fanout_arg =
            self.fanout_group as u32 | ((PACKET_FANOUT_HASH | PACKET_FANOUT_FLAG_DEFRAG) << 16);
        for slot in &self.slots {
            if let Some(fd) = &slot.rx {
                bind_to_interface(fd, self.if_index, libc::ETH_P_ALL as u16)?;
                if conf.rx_queues > 1 {
                    set_packet_opt(fd, PACKET_FANOUT, &fanout_arg)?;
                }
            }
            if let Some(fd) = &slot.tx {
                bind_to_interface(fd, self.if_index, 0)?;
            }
        }

        // Sockets that were bound before the last one joined the group saw every frame
        let mut dropped = 0;
        for fd in self.slots.iter().filter_map(|slot| slot.rx.as_ref()) {
            dropped += drain_socket(fd.as_raw_fd());
        }
        if dropped > 0 {
            debug!(dropped, "Discarded frames queued before fanout");
        }

        self.state = PortState::Started;
        info!(
            name = %self.name,
            rx_queues = conf.rx_queues,
            tx_queues = conf.tx_queues,
            fanout_group = self.fanout_group,
            "Port started"
        );
        Ok(())
    }

    fn stop(&mut self) -> Result<(), PortError> {
        expect_state(self.state, &[PortState::Started], "started")?;
        // Sockets still held here stop receiving once closed; taken ones
        // close when their forwarder goes away.
        self.slots.clear();
        self.state = PortState::Stopped;
        info!(name = %self.name, "Port stopped");
        Ok(())
    }

    fn close(&mut self) -> Result<(), PortError> {
        if self.state == PortState::Closed {
            return Ok(());
        }
        if let Some(control) = self.control.take() {
            let _ = promisc_membership(&control, self.if_index, false);
        }
        self.slots.clear();
        self.conf = None;
        self.state = PortState::Closed;
        debug!(name = %self.name, "Port closed");
        Ok(())
    }

    fn mac_address(&self) -> Result<EthernetAddress, PortError> {
        if self.if_index == 0 {
            return Err(PortError::NotFound(self.ident.clone()));
        }
        let (_, mac) = hw_address(&self.name)?;
        Ok(EthernetAddress(mac))
    }

    fn set_promiscuous(&mut self, enable: bool) -> Result<(), PortError> {
        expect_state(
            self.state,
            &[PortState::Configured, PortState::Started],
            "configured or started",
        )?;
        match (enable, self.control.take()) {
            (true, Some(control)) => self.control = Some(control),
            (true, None) => {
                let control = packet_socket()?;
                promisc_membership(&control, self.if_index, true)?;
                self.control = Some(control);
            }
            (false, Some(control)) => promisc_membership(&control, self.if_index, false)?,
            (false, None) => {}
        }
        Ok(())
    }

    fn take_queue_pairs(&mut self) -> Result<Vec<QueuePair<AfPacketRx, AfPacketTx>>, PortError> {
        expect_state(self.state, &[PortState::Started], "started")?;
        let mut pairs = Vec::with_capacity(self.slots.len());
        for (queue, slot) in self.slots.iter_mut().enumerate() {
            let queue = queue as u16;
            let (Some(rx), Some(tx), Some(pool)) = (slot.rx.take(), slot.tx.take(), slot.pool)
            else {
                warn!(queue, "Queue pair incomplete or already taken");
                return Err(PortError::QueueNotSetUp { kind: "rx", queue });
            };
            pairs.push(QueuePair {
                queue_id: queue,
                rx: AfPacketRx {
                    queue_id: queue,
                    fd: rx,
                    cache: PoolCache::new(pool),
                },
                tx: AfPacketTx {
                    queue_id: queue,
                    fd: tx,
                },
            });
        }
        Ok(pairs)
    }
}

impl Drop for AfPacketPort {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Receive half of an AF_PACKET queue pair
pub struct AfPacketRx {
    queue_id: u16,
    fd: OwnedFd,
    cache: PoolCache,
}

impl AfPacketRx {
    fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl RxQueue for AfPacketRx {
    fn queue_id(&self) -> u16 {
        self.queue_id
    }

    fn rx_burst(&mut self, pkts: &mut Vec<PoolBuffer>, max: usize) -> usize {
        let fd = self.raw_fd();
        let room = self.cache.pool().data_room();
        let mut received = 0;
        while received < max {
            // Pool exhausted: leave the frames queued in the kernel
            let Some(mut buf) = self.cache.alloc() else {
                break;
            };
            // MSG_TRUNC reports the full frame length even when it did not fit
            match recv(fd, buf.write_area(), MsgFlags::MSG_DONTWAIT | MsgFlags::MSG_TRUNC) {
                Ok(len) if len > room => self.cache.put(buf),
                Ok(len) => {
                    buf.set_len(len);
                    pkts.push(buf);
                    received += 1;
                }
                Err(_) => {
                    self.cache.put(buf);
                    break;
                }
            }
        }
        received
    }
}

/// Transmit half of an AF_PACKET queue pair
pub struct AfPacketTx {
    queue_id: u16,
    fd: OwnedFd,
}

impl TxQueue for AfPacketTx {
    fn queue_id(&self) -> u16 {
        self.queue_id
    }

    /// Frames the kernel rejects outright (e.g. `EMSGSIZE`) are dropped and
    /// count as taken; only a full socket buffer ends the burst early.
    fn tx_burst(&mut self, pkts: &mut Vec<PoolBuffer>) -> usize {
        let fd = self.fd.as_raw_fd();
        let mut taken = 0;
        for pkt in pkts.iter() {
            match send(fd, pkt.data(), MsgFlags::MSG_DONTWAIT) {
                Err(Errno::EAGAIN | Errno::ENOBUFS | Errno::EINTR) => break,
                Ok(_) | Err(_) => taken += 1,
            }
        }
        // The kernel copied these frames; their buffers go back to the pool
        for pkt in pkts.drain(..taken) {
            pkt.free();
        }
        taken
    }
}
