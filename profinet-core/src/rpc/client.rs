// PROFINET for Rust
// SPDX-License-Identifier: MPL-2.0

//! The UDP RPC engine: frames calls to a device's connection manager and matches the answers.

use std::io::Cursor;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use log::{debug, trace, warn};
use profinet_types::{BinaryDecodable, BinaryEncodable, PnUuid, PnioStatus};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use super::header::{Opnum, RpcHeader, RpcPacketType, RPC_HEADER_LEN};
use super::ndr::{NdrHeader, NDR_HEADER_LEN};

/// Default per-call deadline before the single retry.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(3);

/// Largest argument buffer the client announces it will accept.
const ARGS_MAXIMUM: u32 = 16 * 1024;

/// Largest datagram the client will read.
const MAX_DATAGRAM: usize = 16 * 1024 + RPC_HEADER_LEN + NDR_HEADER_LEN;

/// Errors surfaced by the RPC engine.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The device never answered, even after the retry.
    #[error("RPC call timed out after {0:?} and one retry")]
    Timeout(Duration),
    /// The device answered with a non-zero PNIO status.
    #[error("device answered PNIO status {0}")]
    Pnio(PnioStatus),
    /// The call was faulted or rejected at the RPC layer.
    #[error("call rejected by peer, status {0:#010X}")]
    Rejected(u32),
    /// The device answered something the codec cannot make sense of.
    #[error("malformed RPC packet: {0}")]
    Codec(#[from] profinet_types::Error),
    /// The socket failed.
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// A connection-manager RPC endpoint on one device, bound to one local interface address.
///
/// The local socket must be bound to the real interface IP, never 0.0.0.0, so the kernel
/// sources outbound datagrams from an address the device can answer.
pub struct RpcClient {
    socket: UdpSocket,
    remote: SocketAddrV4,
    object_uuid: PnUuid,
    activity_uuid: PnUuid,
    sequence_number: u32,
    serial: u16,
    timeout: Duration,
}

impl RpcClient {
    /// Bind an ephemeral UDP port on `local_ip` and aim it at `remote`.
    pub async fn bind(
        local_ip: Ipv4Addr,
        remote: SocketAddrV4,
        object_uuid: PnUuid,
        call_timeout: Duration,
    ) -> Result<RpcClient, RpcError> {
        let socket = UdpSocket::bind(SocketAddr::V4(SocketAddrV4::new(local_ip, 0))).await?;
        socket.connect(SocketAddr::V4(remote)).await?;
        debug!(
            "rpc endpoint {} -> {} for object {}",
            socket.local_addr()?,
            remote,
            object_uuid
        );
        Ok(RpcClient {
            socket,
            remote,
            object_uuid,
            activity_uuid: PnUuid::new(),
            sequence_number: 0,
            serial: 0,
            timeout: call_timeout,
        })
    }

    /// The remote endpoint this client calls.
    pub fn remote(&self) -> SocketAddrV4 {
        self.remote
    }

    /// The object UUID stamped on every call.
    pub fn object_uuid(&self) -> PnUuid {
        self.object_uuid
    }

    /// Perform one call: encode header and NDR prelude, send, await the matching response.
    /// A deadline expiry is retried once before surfacing [`RpcError::Timeout`].
    pub async fn call(&mut self, opnum: Opnum, payload: &[u8]) -> Result<Vec<u8>, RpcError> {
        let sequence_number = self.sequence_number;
        self.sequence_number = self.sequence_number.wrapping_add(1);

        let fragment_length = (NDR_HEADER_LEN + payload.len()) as u16;
        let mut header = RpcHeader::request(
            self.object_uuid,
            self.activity_uuid,
            sequence_number,
            opnum,
            fragment_length,
        );

        for attempt in 0..2 {
            let serial = self.serial;
            self.serial = self.serial.wrapping_add(1);
            header.serial_high = (serial >> 8) as u8;
            header.serial_low = (serial & 0xFF) as u8;

            let mut datagram = Vec::with_capacity(RPC_HEADER_LEN + fragment_length as usize);
            header.encode(&mut datagram)?;
            NdrHeader::for_request(payload.len(), ARGS_MAXIMUM).encode(&mut datagram)?;
            datagram.extend_from_slice(payload);

            self.socket.send(&datagram).await?;
            trace!(
                "sent {:?} seq {} ({} bytes) to {}",
                opnum,
                sequence_number,
                datagram.len(),
                self.remote
            );

            match timeout(self.timeout, self.recv_matching(sequence_number)).await {
                Ok(result) => return result,
                Err(_) if attempt == 0 => {
                    warn!(
                        "{:?} seq {} to {} timed out, retrying",
                        opnum, sequence_number, self.remote
                    );
                }
                Err(_) => break,
            }
        }
        Err(RpcError::Timeout(self.timeout))
    }

    /// Receive datagrams until one matches the activity and sequence of the outstanding call,
    /// then interpret it.
    async fn recv_matching(&self, sequence_number: u32) -> Result<Vec<u8>, RpcError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let n = self.socket.recv(&mut buf).await?;
            let mut cursor = Cursor::new(&buf[..n]);
            let header = match RpcHeader::decode(&mut cursor) {
                Ok(h) => h,
                Err(e) => {
                    warn!("dropping undecodable datagram from {}: {e}", self.remote);
                    continue;
                }
            };
            if header.activity_uuid != self.activity_uuid
                || header.sequence_number != sequence_number
            {
                trace!(
                    "ignoring stray packet seq {} (waiting for {})",
                    header.sequence_number,
                    sequence_number
                );
                continue;
            }
            let body = &buf[cursor.position() as usize..n];
            match header.packet_type {
                RpcPacketType::Response => {
                    return Self::unwrap_response_body(body);
                }
                RpcPacketType::Fault | RpcPacketType::Reject => {
                    let status = if body.len() >= 4 {
                        u32::from_le_bytes([body[0], body[1], body[2], body[3]])
                    } else {
                        0
                    };
                    return Err(RpcError::Rejected(status));
                }
                RpcPacketType::Request => {
                    // The device may interleave its own calls (ApplicationReady); those are
                    // handled by `wait_for_request`, not here.
                    trace!("ignoring device-initiated request during pending call");
                    continue;
                }
            }
        }
    }

    /// Strip the response prelude. Its first field carries the PNIO status in responses; a
    /// non-zero value is the device refusing the operation.
    fn unwrap_response_body(body: &[u8]) -> Result<Vec<u8>, RpcError> {
        let mut cursor = Cursor::new(body);
        let ndr = NdrHeader::decode(&mut cursor)?;
        let status = PnioStatus::from_u32(ndr.args_maximum);
        if !status.is_ok() {
            return Err(RpcError::Pnio(status));
        }
        let start = cursor.position() as usize;
        let end = start + ndr.args_length as usize;
        if end > body.len() {
            return Err(RpcError::Codec(profinet_types::Error::invalid_length(
                format!(
                    "NDR announces {} argument bytes, datagram carries {}",
                    ndr.args_length,
                    body.len() - start
                ),
            )));
        }
        Ok(body[start..end].to_vec())
    }

    /// Await a device-initiated request, e.g. the ApplicationReady control call. Returns the
    /// request header and the argument bytes after its NDR prelude.
    pub async fn wait_for_request(&self) -> Result<(RpcHeader, Vec<u8>), RpcError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let n = self.socket.recv(&mut buf).await?;
            let mut cursor = Cursor::new(&buf[..n]);
            let header = match RpcHeader::decode(&mut cursor) {
                Ok(h) => h,
                Err(e) => {
                    warn!("dropping undecodable datagram from {}: {e}", self.remote);
                    continue;
                }
            };
            if header.packet_type != RpcPacketType::Request {
                trace!("ignoring non-request while waiting for device call");
                continue;
            }
            let body = &buf[cursor.position() as usize..n];
            let mut body_cursor = Cursor::new(body);
            let ndr = NdrHeader::decode(&mut body_cursor)?;
            let start = body_cursor.position() as usize;
            let end = (start + ndr.args_length as usize).min(body.len());
            return Ok((header, body[start..end].to_vec()));
        }
    }

    /// Answer a device-initiated request with `payload` and a success status.
    pub async fn send_response(
        &self,
        request: &RpcHeader,
        payload: &[u8],
    ) -> Result<(), RpcError> {
        let fragment_length = (NDR_HEADER_LEN + payload.len()) as u16;
        let header = RpcHeader::response_to(request, fragment_length);
        let mut datagram = Vec::with_capacity(RPC_HEADER_LEN + fragment_length as usize);
        header.encode(&mut datagram)?;
        NdrHeader::for_response(payload.len()).encode(&mut datagram)?;
        datagram.extend_from_slice(payload);
        self.socket.send(&datagram).await?;
        Ok(())
    }
}
