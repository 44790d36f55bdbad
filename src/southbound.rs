//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::SendError;
use tokio::sync::mpsc::{Sender, UnboundedReceiver};

use crate::dataflow::DataflowKind;
use crate::network::AsyncSocket;
use crate::tasks::messages::input::{
    KernelUpcallMsg, MfcResultMsg, SgCountUpdMsg,
};

// Multicast-routing socket options (IPPROTO_IP level).
pub const MRT_INIT: libc::c_int = 200;
pub const MRT_DONE: libc::c_int = 201;
pub const MRT_ADD_VIF: libc::c_int = 202;
pub const MRT_DEL_VIF: libc::c_int = 203;
pub const MRT_ADD_MFC: libc::c_int = 204;
pub const MRT_DEL_MFC: libc::c_int = 205;

// Flag for vifctl to identify the interface by ifindex.
pub const VIFF_USE_IFINDEX: u8 = 8;

// Upcall message types delivered on the multicast-routing socket.
const IGMPMSG_NOCACHE: u8 = 1;
const IGMPMSG_WRONGVIF: u8 = 2;
const IGMPMSG_WHOLEPKT: u8 = 3;

// SIOCGETSGCNT ioctl (SIOCPROTOPRIVATE + 1).
#[cfg(not(feature = "testing"))]
const SIOCGETSGCNT: libc::c_ulong = 0x89E1;

// The kernel forwarder supports up to 32 virtual interfaces.
pub const MAX_VIFS: u8 = 32;

// Set of kernel virtual-interface indexes.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct VifSet(pub u32);

// Requests to the kernel forwarding engine.
#[derive(Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum MfcReq {
    AddVif { ifindex: u32, vif: u8 },
    DelVif { vif: u8 },
    AddMfc(MfcAddReq),
    DelMfc { source: Ipv4Addr, group: Ipv4Addr },
    GetSgCount { source: Ipv4Addr, group: Ipv4Addr, kind: DataflowKind },
}

#[derive(Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct MfcAddReq {
    pub source: Ipv4Addr,
    pub group: Ipv4Addr,
    pub iif: u8,
    pub oifs: VifSet,
    // Interfaces for which WRONGVIF upcalls are of no interest.
    pub wrongvif_suppress: VifSet,
    pub rp_addr: Option<Ipv4Addr>,
}

// Per-(S,G) forwarding statistics read from the kernel.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct SgCount {
    pub packets: u64,
    pub bytes: u64,
    pub wrong_if: u64,
}

// Kernel upcall kinds.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum UpcallKind {
    // No MFC matched a received multicast packet.
    NoCache,
    // A packet arrived on an interface other than the MFC iif.
    WrongVif,
    // A copy of the whole packet, for Register encapsulation.
    WholePacket,
}

// Kernel upcall message.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct Upcall {
    pub kind: UpcallKind,
    pub vif: u8,
    pub source: Ipv4Addr,
    pub group: Ipv4Addr,
    // The full packet, present on WHOLEPKT upcalls for Register
    // encapsulation.
    pub data: bytes::Bytes,
}

// ===== impl VifSet =====

impl VifSet {
    pub(crate) fn insert(&mut self, vif: u8) {
        debug_assert!(vif < MAX_VIFS);
        self.0 |= 1 << vif;
    }

    pub(crate) fn remove(&mut self, vif: u8) {
        self.0 &= !(1 << vif);
    }

    pub(crate) fn contains(&self, vif: u8) -> bool {
        self.0 & (1 << vif) != 0
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        (0..MAX_VIFS).filter(|vif| self.contains(*vif))
    }
}

// ===== global functions =====

// Creates the multicast-routing socket. Upcalls are delivered on this
// socket and MFC mutations are applied through it.
pub(crate) fn mroute_socket() -> Result<AsyncSocket, std::io::Error> {
    #[cfg(not(feature = "testing"))]
    {
        use socket2::{Domain, Protocol, Type};

        let socket = socket2::Socket::new(
            Domain::IPV4,
            Type::RAW,
            Some(Protocol::from(libc::IPPROTO_IGMP)),
        )?;
        socket.set_nonblocking(true)?;
        let optval = 1 as libc::c_int;
        crate::network::setsockopt(
            &socket,
            libc::IPPROTO_IP,
            MRT_INIT,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        )?;

        AsyncSocket::new(socket)
    }
    #[cfg(feature = "testing")]
    {
        Ok(AsyncSocket::default())
    }
}

// Applies forwarding requests to the kernel and answers statistics reads.
#[cfg(not(feature = "testing"))]
pub(crate) async fn apply_loop(
    socket: std::sync::Arc<AsyncSocket>,
    mut mfc_reqc: UnboundedReceiver<MfcReq>,
    sg_count_updp: Sender<SgCountUpdMsg>,
    mfc_resultp: Sender<MfcResultMsg>,
) {
    while let Some(req) = mfc_reqc.recv().await {
        match req {
            MfcReq::AddVif { ifindex, vif } => {
                if let Err(error) = add_vif(&socket, ifindex, vif) {
                    tracing::warn!(%ifindex, %vif, %error, "failed to add vif");
                }
            }
            MfcReq::DelVif { vif } => {
                if let Err(error) = del_vif(&socket, vif) {
                    tracing::warn!(%vif, %error, "failed to delete vif");
                }
            }
            MfcReq::AddMfc(req) => {
                let result = add_mfc(&socket, &req);
                if let Err(error) = &result {
                    tracing::warn!(
                        source = %req.source, group = %req.group, %error,
                        "failed to install forwarding entry"
                    );
                }
                let msg = MfcResultMsg {
                    source: req.source,
                    group: req.group,
                    success: result.is_ok(),
                };
                let _ = mfc_resultp.send(msg).await;
            }
            MfcReq::DelMfc { source, group } => {
                if let Err(error) = del_mfc(&socket, source, group) {
                    tracing::warn!(
                        %source, %group, %error,
                        "failed to remove forwarding entry"
                    );
                }
            }
            MfcReq::GetSgCount {
                source,
                group,
                kind,
            } => match sg_count(&socket, source, group) {
                Ok(count) => {
                    let msg = SgCountUpdMsg {
                        source,
                        group,
                        kind,
                        count,
                    };
                    let _ = sg_count_updp.send(msg).await;
                }
                Err(error) => {
                    tracing::warn!(
                        %source, %group, %error,
                        "failed to read forwarding statistics"
                    );
                }
            },
        }
    }
}

// Reads kernel upcalls from the multicast-routing socket.
#[cfg(not(feature = "testing"))]
pub(crate) async fn upcall_read_loop(
    socket: std::sync::Arc<AsyncSocket>,
    upcallp: Sender<KernelUpcallMsg>,
) -> Result<(), SendError<KernelUpcallMsg>> {
    use std::os::fd::AsRawFd;

    let mut buf = [0u8; 4096];

    loop {
        match socket
            .async_io(tokio::io::Interest::READABLE, |socket| {
                let ret = unsafe {
                    libc::recv(
                        socket.as_raw_fd(),
                        buf.as_mut_ptr() as *mut libc::c_void,
                        buf.len(),
                        0,
                    )
                };
                if ret < 0 {
                    Err(std::io::Error::last_os_error())
                } else {
                    Ok(ret as usize)
                }
            })
            .await
        {
            Ok(len) => {
                if let Some(upcall) = parse_upcall(&buf[..len]) {
                    upcallp.send(KernelUpcallMsg { upcall }).await?;
                }
            }
            Err(error) if error.kind() == std::io::ErrorKind::Interrupted => {
                continue;
            }
            Err(error) => {
                crate::error::IoError::RecvError(error).log();
            }
        }
    }
}

// Parses an igmpmsg-shaped upcall frame. The frame overlays an IPv4 header
// where the protocol field carries the upcall type and TOS is zero.
pub(crate) fn parse_upcall(data: &[u8]) -> Option<Upcall> {
    // struct igmpmsg: unused(8) | im_msgtype | im_mbz | im_vif | im_vif_hi
    //                 | im_src(4) | im_dst(4)
    if data.len() < 20 {
        return None;
    }
    let msgtype = data[8];
    let mbz = data[9];
    if mbz != 0 {
        return None;
    }
    let kind = match msgtype {
        IGMPMSG_NOCACHE => UpcallKind::NoCache,
        IGMPMSG_WRONGVIF => UpcallKind::WrongVif,
        IGMPMSG_WHOLEPKT => UpcallKind::WholePacket,
        _ => return None,
    };
    let vif = data[10];
    let source = Ipv4Addr::new(data[12], data[13], data[14], data[15]);
    let group = Ipv4Addr::new(data[16], data[17], data[18], data[19]);
    let payload = match kind {
        UpcallKind::WholePacket => bytes::Bytes::copy_from_slice(data),
        _ => bytes::Bytes::new(),
    };

    Some(Upcall {
        kind,
        vif,
        source,
        group,
        data: payload,
    })
}

// ===== helper functions =====

#[cfg(not(feature = "testing"))]
fn add_vif(
    socket: &AsyncSocket,
    ifindex: u32,
    vif: u8,
) -> Result<(), std::io::Error> {
    #[repr(C)]
    struct vifctl {
        vifc_vifi: libc::c_ushort,
        vifc_flags: libc::c_uchar,
        vifc_threshold: libc::c_uchar,
        vifc_rate_limit: libc::c_uint,
        vifc_lcl_ifindex: libc::c_int,
        vifc_rmt_addr: libc::in_addr,
    }

    let vifc = vifctl {
        vifc_vifi: vif as libc::c_ushort,
        vifc_flags: VIFF_USE_IFINDEX,
        vifc_threshold: 1,
        vifc_rate_limit: 0,
        vifc_lcl_ifindex: ifindex as libc::c_int,
        vifc_rmt_addr: libc::in_addr { s_addr: 0 },
    };

    crate::network::setsockopt(
        socket.get_ref(),
        libc::IPPROTO_IP,
        MRT_ADD_VIF,
        &vifc as *const _ as *const libc::c_void,
        std::mem::size_of::<vifctl>() as libc::socklen_t,
    )
}

#[cfg(not(feature = "testing"))]
fn del_vif(socket: &AsyncSocket, vif: u8) -> Result<(), std::io::Error> {
    let vifi = vif as libc::c_ushort;

    crate::network::setsockopt(
        socket.get_ref(),
        libc::IPPROTO_IP,
        MRT_DEL_VIF,
        &vifi as *const _ as *const libc::c_void,
        std::mem::size_of::<libc::c_ushort>() as libc::socklen_t,
    )
}

#[cfg(not(feature = "testing"))]
#[repr(C)]
struct mfcctl {
    mfcc_origin: libc::in_addr,
    mfcc_mcastgrp: libc::in_addr,
    mfcc_parent: libc::c_ushort,
    mfcc_ttls: [libc::c_uchar; MAX_VIFS as usize],
    mfcc_pkt_cnt: libc::c_uint,
    mfcc_byte_cnt: libc::c_uint,
    mfcc_wrong_if: libc::c_uint,
    mfcc_expire: libc::c_int,
}

#[cfg(not(feature = "testing"))]
fn add_mfc(socket: &AsyncSocket, req: &MfcAddReq) -> Result<(), std::io::Error> {
    let mut ttls = [0u8; MAX_VIFS as usize];
    for vif in req.oifs.iter() {
        if vif != req.iif {
            ttls[vif as usize] = 1;
        }
    }

    let mfcc = mfcctl {
        mfcc_origin: libc::in_addr {
            s_addr: u32::from(req.source).to_be(),
        },
        mfcc_mcastgrp: libc::in_addr {
            s_addr: u32::from(req.group).to_be(),
        },
        mfcc_parent: req.iif as libc::c_ushort,
        mfcc_ttls: ttls,
        mfcc_pkt_cnt: 0,
        mfcc_byte_cnt: 0,
        mfcc_wrong_if: 0,
        mfcc_expire: 0,
    };

    crate::network::setsockopt(
        socket.get_ref(),
        libc::IPPROTO_IP,
        MRT_ADD_MFC,
        &mfcc as *const _ as *const libc::c_void,
        std::mem::size_of::<mfcctl>() as libc::socklen_t,
    )
}

#[cfg(not(feature = "testing"))]
fn del_mfc(
    socket: &AsyncSocket,
    source: Ipv4Addr,
    group: Ipv4Addr,
) -> Result<(), std::io::Error> {
    let mfcc = mfcctl {
        mfcc_origin: libc::in_addr {
            s_addr: u32::from(source).to_be(),
        },
        mfcc_mcastgrp: libc::in_addr {
            s_addr: u32::from(group).to_be(),
        },
        mfcc_parent: 0,
        mfcc_ttls: [0; MAX_VIFS as usize],
        mfcc_pkt_cnt: 0,
        mfcc_byte_cnt: 0,
        mfcc_wrong_if: 0,
        mfcc_expire: 0,
    };

    crate::network::setsockopt(
        socket.get_ref(),
        libc::IPPROTO_IP,
        MRT_DEL_MFC,
        &mfcc as *const _ as *const libc::c_void,
        std::mem::size_of::<mfcctl>() as libc::socklen_t,
    )
}

#[cfg(not(feature = "testing"))]
fn sg_count(
    socket: &AsyncSocket,
    source: Ipv4Addr,
    group: Ipv4Addr,
) -> Result<SgCount, std::io::Error> {
    use std::os::fd::AsRawFd;

    #[repr(C)]
    struct sioc_sg_req {
        src: libc::in_addr,
        grp: libc::in_addr,
        pktcnt: libc::c_ulong,
        bytecnt: libc::c_ulong,
        wrong_if: libc::c_ulong,
    }

    let mut req = sioc_sg_req {
        src: libc::in_addr {
            s_addr: u32::from(source).to_be(),
        },
        grp: libc::in_addr {
            s_addr: u32::from(group).to_be(),
        },
        pktcnt: 0,
        bytecnt: 0,
        wrong_if: 0,
    };

    let ret = unsafe {
        libc::ioctl(
            socket.get_ref().as_raw_fd(),
            SIOCGETSGCNT,
            &mut req as *mut _ as *mut libc::c_void,
        )
    };
    if ret == -1 {
        return Err(std::io::Error::last_os_error());
    }

    Ok(SgCount {
        packets: req.pktcnt as u64,
        bytes: req.bytecnt as u64,
        wrong_if: req.wrong_if as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_upcall() {
        let mut frame = [0u8; 20];
        frame[8] = IGMPMSG_WRONGVIF;
        frame[10] = 3;
        frame[12..16].copy_from_slice(&[10, 0, 0, 5]);
        frame[16..20].copy_from_slice(&[239, 1, 1, 1]);

        let upcall = parse_upcall(&frame).unwrap();
        assert_eq!(upcall.kind, UpcallKind::WrongVif);
        assert_eq!(upcall.vif, 3);
        assert_eq!(upcall.source, Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(upcall.group, Ipv4Addr::new(239, 1, 1, 1));

        // Truncated frames and unknown types are dropped.
        assert!(parse_upcall(&frame[..12]).is_none());
        frame[8] = 99;
        assert!(parse_upcall(&frame).is_none());
    }

    #[test]
    fn test_vif_set() {
        let mut set = VifSet::default();
        assert!(set.is_empty());
        set.insert(0);
        set.insert(5);
        set.insert(31);
        assert!(set.contains(0) && set.contains(5) && set.contains(31));
        assert!(!set.contains(1));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 5, 31]);
        set.remove(5);
        assert!(!set.contains(5));
    }
}
