// PROFINET for Rust
// SPDX-License-Identifier: MPL-2.0

//! The raw Layer 2 socket every PROFINET frame rides on, and the Ethernet header codec.
//!
//! One socket exists per interface. Discovery and every cyclic scheduler write through a single
//! writer task fed by a bounded queue, so frames from different tasks never interleave at the
//! syscall level.

use std::ffi::CString;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, error, warn};
use profinet_types::{
    constants::{PROFINET_ETHERTYPE, VLAN_ETHERTYPE},
    process_decode_io_result, process_encode_io_result, read_u16, write_u16, BinaryDecodable,
    BinaryEncodable, EncodingResult,
};
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Untagged Ethernet header length.
pub const ETHERNET_HEADER_LEN: usize = 14;

/// An untagged Ethernet II header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthernetHeader {
    /// Destination MAC.
    pub dst: [u8; 6],
    /// Source MAC.
    pub src: [u8; 6],
    /// EtherType, [`PROFINET_ETHERTYPE`] for everything this stack sends.
    pub ethertype: u16,
}

impl EthernetHeader {
    /// A PROFINET header between the given endpoints.
    pub fn new(dst: [u8; 6], src: [u8; 6]) -> EthernetHeader {
        EthernetHeader {
            dst,
            src,
            ethertype: PROFINET_ETHERTYPE,
        }
    }
}

impl BinaryEncodable for EthernetHeader {
    fn byte_len(&self) -> usize {
        ETHERNET_HEADER_LEN
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        process_encode_io_result(stream.write_all(&self.dst))?;
        process_encode_io_result(stream.write_all(&self.src))?;
        write_u16(stream, self.ethertype)
    }
}

impl BinaryDecodable for EthernetHeader {
    fn decode<S: Read + ?Sized>(stream: &mut S) -> EncodingResult<Self> {
        let mut dst = [0u8; 6];
        let mut src = [0u8; 6];
        process_decode_io_result(stream.read_exact(&mut dst))?;
        process_decode_io_result(stream.read_exact(&mut src))?;
        let ethertype = read_u16(stream)?;
        Ok(EthernetHeader {
            dst,
            src,
            ethertype,
        })
    }
}

/// Split a received frame into its header and PROFINET payload, tolerating one 802.1Q tag.
/// Returns `None` for frames of other EtherTypes.
pub fn parse_profinet_frame(frame: &[u8]) -> Option<(EthernetHeader, &[u8])> {
    let mut stream = frame;
    let mut header = EthernetHeader::decode(&mut stream).ok()?;
    let mut offset = ETHERNET_HEADER_LEN;
    if header.ethertype == VLAN_ETHERTYPE {
        if frame.len() < offset + 4 {
            return None;
        }
        header.ethertype = u16::from_be_bytes([frame[offset + 2], frame[offset + 3]]);
        offset += 4;
    }
    if header.ethertype != PROFINET_ETHERTYPE {
        return None;
    }
    Some((header, &frame[offset..]))
}

/// Pick the first non-loopback interface that is operationally up.
pub fn detect_interface() -> io::Result<String> {
    let mut candidates = Vec::new();
    for entry in std::fs::read_dir("/sys/class/net")? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == "lo" {
            continue;
        }
        let operstate = std::fs::read_to_string(entry.path().join("operstate"))
            .unwrap_or_default();
        if operstate.trim() == "up" {
            return Ok(name);
        }
        candidates.push(name);
    }
    candidates.into_iter().next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            "no usable network interface found under /sys/class/net",
        )
    })
}

/// Read an interface's MAC address from sysfs.
fn interface_mac(interface: &str) -> io::Result<[u8; 6]> {
    let text = std::fs::read_to_string(format!("/sys/class/net/{interface}/address"))?;
    let mut mac = [0u8; 6];
    let mut parts = text.trim().split(':');
    for byte in mac.iter_mut() {
        let part = parts.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "malformed MAC in sysfs")
        })?;
        *byte = u8::from_str_radix(part, 16)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    }
    Ok(mac)
}

/// A non-blocking AF_PACKET socket bound to one interface, filtered to the PROFINET EtherType.
///
/// Opening one requires `CAP_NET_RAW`; a missing capability surfaces as `PermissionDenied` and
/// is unrecoverable for the process.
pub struct RawEthernetSocket {
    fd: AsyncFd<OwnedFd>,
    interface: String,
    mac: [u8; 6],
}

impl RawEthernetSocket {
    /// Open and bind the socket. Must run inside a tokio runtime.
    pub fn open(interface: &str) -> io::Result<RawEthernetSocket> {
        let mac = interface_mac(interface)?;
        let name = CString::new(interface)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let ifindex = unsafe { libc::if_nametoindex(name.as_ptr()) };
        if ifindex == 0 {
            return Err(io::Error::last_os_error());
        }

        let protocol = (PROFINET_ETHERTYPE).to_be() as libc::c_int;
        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                protocol,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as u16;
        addr.sll_protocol = (PROFINET_ETHERTYPE).to_be();
        addr.sll_ifindex = ifindex as i32;
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        debug!("raw socket bound to {interface} (ifindex {ifindex}, mac {mac:02X?})");
        Ok(RawEthernetSocket {
            fd: AsyncFd::new(fd)?,
            interface: interface.to_string(),
            mac,
        })
    }

    /// The interface this socket is bound to.
    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// The interface's MAC, used as the source of every outbound frame.
    pub fn mac(&self) -> [u8; 6] {
        self.mac
    }

    /// Transmit one complete Ethernet frame.
    pub async fn send(&self, frame: &[u8]) -> io::Result<()> {
        loop {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| {
                let rc = unsafe {
                    libc::send(
                        inner.as_raw_fd(),
                        frame.as_ptr() as *const libc::c_void,
                        frame.len(),
                        0,
                    )
                };
                if rc < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(rc as usize)
                }
            }) {
                Ok(result) => {
                    result?;
                    return Ok(());
                }
                Err(_would_block) => continue,
            }
        }
    }

    /// Receive one frame into `buf`, returning its length.
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| {
                let rc = unsafe {
                    libc::recv(
                        inner.as_raw_fd(),
                        buf.as_mut_ptr() as *mut libc::c_void,
                        buf.len(),
                        0,
                    )
                };
                if rc < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(rc as usize)
                }
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

/// Spawn the single writer task serialising all frame transmission for one interface.
///
/// Senders enqueue complete frames; the task drains the queue in FIFO order. Dropping every
/// sender ends the task.
pub fn spawn_frame_writer(
    socket: Arc<RawEthernetSocket>,
    mut frames: mpsc::Receiver<Bytes>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            if let Err(e) = socket.send(&frame).await {
                error!("frame transmit on {} failed: {e}", socket.interface());
            }
        }
        warn!("frame writer for {} stopped", socket.interface());
    })
}
