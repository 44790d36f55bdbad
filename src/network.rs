//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::Ipv4Addr;

use tokio::sync::mpsc::error::SendError;
use tokio::sync::mpsc::{Sender, UnboundedReceiver};

use crate::consts::{ALL_PIM_ROUTERS, PIM_IP_PROTO};
use crate::error::IoError;
use crate::packet::Packet;
use crate::tasks::messages::input::NetRxPacketMsg;
use crate::tasks::messages::output::NetTxPacketMsg;

// PIM sockets are raw IPv4 sockets; the async wrapper integrates them with
// the tokio reactor.
#[cfg(not(feature = "testing"))]
pub type AsyncSocket = tokio::io::unix::AsyncFd<socket2::Socket>;
#[cfg(feature = "testing")]
#[derive(Debug, Default)]
pub struct AsyncSocket();

// The Router Alert IP option carried by all transmitted PIM messages.
#[cfg(not(feature = "testing"))]
const ROUTER_ALERT_OPTION: [u8; 4] = [0x94, 0x04, 0x00, 0x00];

// ===== global functions =====

// Creates the shared receive socket. ALL-PIM-ROUTERS membership is joined
// per-interface as interfaces start.
pub(crate) fn socket_rx() -> Result<AsyncSocket, std::io::Error> {
    #[cfg(not(feature = "testing"))]
    {
        use socket2::{Domain, Protocol, Type};

        let socket = socket2::Socket::new(
            Domain::IPV4,
            Type::RAW,
            Some(Protocol::from(PIM_IP_PROTO)),
        )?;
        socket.set_nonblocking(true)?;
        set_ipv4_pktinfo(&socket, true)?;

        AsyncSocket::new(socket)
    }
    #[cfg(feature = "testing")]
    {
        Ok(AsyncSocket::default())
    }
}

// Creates the per-interface transmit socket.
pub(crate) fn socket_tx(ifname: &str) -> Result<AsyncSocket, std::io::Error> {
    #[cfg(not(feature = "testing"))]
    {
        use socket2::{Domain, Protocol, Type};

        let socket = socket2::Socket::new(
            Domain::IPV4,
            Type::RAW,
            Some(Protocol::from(PIM_IP_PROTO)),
        )?;
        socket.bind_device(Some(ifname.as_bytes()))?;
        socket.set_nonblocking(true)?;
        socket.set_multicast_loop_v4(false)?;
        socket.set_multicast_ttl_v4(1)?;
        set_ipv4_tos(&socket, libc::IPTOS_PREC_INTERNETCONTROL as u8)?;
        set_router_alert(&socket)?;

        AsyncSocket::new(socket)
    }
    #[cfg(feature = "testing")]
    {
        Ok(AsyncSocket::default())
    }
}

// Joins ALL-PIM-ROUTERS on the given interface.
pub(crate) fn join_multicast(
    socket: &AsyncSocket,
    ifindex: u32,
) -> Result<(), std::io::Error> {
    #[cfg(not(feature = "testing"))]
    {
        socket.get_ref().join_multicast_v4_n(
            &ALL_PIM_ROUTERS,
            &socket2::InterfaceIndexOrAddress::Index(ifindex),
        )
    }
    #[cfg(feature = "testing")]
    {
        Ok(())
    }
}

// Leaves ALL-PIM-ROUTERS on the given interface.
pub(crate) fn leave_multicast(
    socket: &AsyncSocket,
    ifindex: u32,
) -> Result<(), std::io::Error> {
    #[cfg(not(feature = "testing"))]
    {
        socket.get_ref().leave_multicast_v4_n(
            &ALL_PIM_ROUTERS,
            &socket2::InterfaceIndexOrAddress::Index(ifindex),
        )
    }
    #[cfg(feature = "testing")]
    {
        Ok(())
    }
}

#[cfg(not(feature = "testing"))]
pub(crate) async fn write_loop(
    socket: std::sync::Arc<AsyncSocket>,
    mut net_packet_txc: UnboundedReceiver<NetTxPacketMsg>,
) {
    while let Some(NetTxPacketMsg { dst, packet, .. }) =
        net_packet_txc.recv().await
    {
        if let Err(error) = send_packet(&socket, dst, &packet).await {
            error.log();
        }
    }
}

#[cfg(not(feature = "testing"))]
pub(crate) async fn read_loop(
    socket: std::sync::Arc<AsyncSocket>,
    net_packet_rxp: Sender<NetRxPacketMsg>,
) -> Result<(), SendError<NetRxPacketMsg>> {
    use std::io::IoSliceMut;
    use std::ops::Deref;
    use std::os::fd::AsRawFd;

    use bytes::Buf;
    use nix::sys::socket::{self, SockaddrIn};

    let mut buf = [0; 16384];
    let mut iov = [IoSliceMut::new(&mut buf)];
    let mut cmsgspace = nix::cmsg_space!(libc::in_pktinfo);

    loop {
        // Receive PIM packet.
        match socket
            .async_io(tokio::io::Interest::READABLE, |socket| {
                match socket::recvmsg::<SockaddrIn>(
                    socket.as_raw_fd(),
                    &mut iov,
                    Some(&mut cmsgspace),
                    socket::MsgFlags::empty(),
                ) {
                    Ok(msg) => {
                        let ifindex = msg.cmsgs().unwrap().find_map(|cmsg| {
                            if let socket::ControlMessageOwned::Ipv4PacketInfo(
                                pktinfo,
                            ) = cmsg
                            {
                                Some(pktinfo.ipi_ifindex as u32)
                            } else {
                                None
                            }
                        });
                        Ok((ifindex, msg.address, msg.bytes))
                    }
                    Err(errno) => Err(errno.into()),
                }
            })
            .await
        {
            Ok((ifindex, src, bytes)) => {
                let Some(ifindex) = ifindex else {
                    IoError::RecvMissingAncillaryData.log();
                    continue;
                };
                let Some(src) = src else {
                    IoError::RecvMissingSourceAddr.log();
                    continue;
                };

                // Move past the IPv4 header.
                let mut buf =
                    bytes::Bytes::copy_from_slice(&iov[0].deref()[0..bytes]);
                let hdr_len = buf.get_u8() & 0x0F;
                buf.advance(((hdr_len << 2) - 1) as usize);

                // Decode PIM packet.
                let packet = Packet::decode(&buf);
                let msg = NetRxPacketMsg {
                    ifindex,
                    src: src.ip(),
                    packet,
                };
                net_packet_rxp.send(msg).await?;
            }
            Err(error) if error.kind() == std::io::ErrorKind::Interrupted => {
                // Retry if the syscall was interrupted (EINTR).
                continue;
            }
            Err(error) => {
                IoError::RecvError(error).log();
            }
        }
    }
}

// ===== helper functions =====

#[cfg(not(feature = "testing"))]
async fn send_packet(
    socket: &AsyncSocket,
    dst: Ipv4Addr,
    packet: &Packet,
) -> Result<usize, IoError> {
    use std::io::IoSlice;
    use std::net::SocketAddrV4;
    use std::os::fd::AsRawFd;

    use nix::sys::socket::{self, SockaddrIn};

    // Encode packet.
    let buf = packet.encode();

    // Send packet.
    let iov = [IoSlice::new(&buf)];
    let sockaddr: SockaddrIn = SocketAddrV4::new(dst, 0).into();
    socket
        .async_io(tokio::io::Interest::WRITABLE, |socket| {
            socket::sendmsg(
                socket.as_raw_fd(),
                &iov,
                &[],
                socket::MsgFlags::empty(),
                Some(&sockaddr),
            )
            .map_err(|errno| errno.into())
        })
        .await
        .map_err(IoError::SendError)
}

#[cfg(not(feature = "testing"))]
fn set_router_alert(socket: &socket2::Socket) -> Result<(), std::io::Error> {
    setsockopt(
        socket,
        libc::IPPROTO_IP,
        libc::IP_OPTIONS,
        ROUTER_ALERT_OPTION.as_ptr() as *const libc::c_void,
        ROUTER_ALERT_OPTION.len() as libc::socklen_t,
    )
}

#[cfg(not(feature = "testing"))]
fn set_ipv4_tos(
    socket: &socket2::Socket,
    tos: u8,
) -> Result<(), std::io::Error> {
    let optval = tos as libc::c_int;

    setsockopt(
        socket,
        libc::IPPROTO_IP,
        libc::IP_TOS,
        &optval as *const _ as *const libc::c_void,
        std::mem::size_of::<i32>() as libc::socklen_t,
    )
}

#[cfg(not(feature = "testing"))]
fn set_ipv4_pktinfo(
    socket: &socket2::Socket,
    value: bool,
) -> Result<(), std::io::Error> {
    let optval = value as libc::c_int;

    setsockopt(
        socket,
        libc::IPPROTO_IP,
        libc::IP_PKTINFO,
        &optval as *const _ as *const libc::c_void,
        std::mem::size_of::<i32>() as libc::socklen_t,
    )
}

#[cfg(not(feature = "testing"))]
pub(crate) fn setsockopt<F: std::os::fd::AsRawFd>(
    sock: &F,
    level: libc::c_int,
    optname: libc::c_int,
    optval: *const libc::c_void,
    optlen: libc::socklen_t,
) -> Result<(), std::io::Error> {
    let ret = unsafe {
        libc::setsockopt(sock.as_raw_fd(), level, optname, optval, optlen)
    };
    if ret == -1 {
        return Err(std::io::Error::last_os_error());
    }

    Ok(())
}
