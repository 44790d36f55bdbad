//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::Ipv4Addr;

use tracing::{error, warn, warn_span};

use crate::packet::DecodeError;

// PIM errors.
#[derive(Debug)]
pub enum Error {
    IoError(IoError),
    InterfaceStartError(String, IoError),
    // Packet from an unknown interface index.
    InterfaceNotFound(u32),
    // Malformed packet (counted, never fatal).
    PacketDecodeError(u32, Ipv4Addr, DecodeError),
    // Join/Prune, Assert or Register-Stop from an address that never sent
    // a Hello, while no-Hello neighbors are not accepted.
    NoHelloNeighbor(u32, Ipv4Addr),
    // Join and Prune queued for the same entry in the same batch.
    JpConflictingEntry(Ipv4Addr, Ipv4Addr),
    // MRIB next-hop doesn't resolve to a local interface.
    MribBadNextHop(Ipv4Addr, Ipv4Addr),
    // Kernel rejected an MFC mutation.
    MfcInstallError(Ipv4Addr, Ipv4Addr),
}

// PIM I/O errors.
#[derive(Debug)]
pub enum IoError {
    SocketError(std::io::Error),
    MulticastJoinError(std::io::Error),
    RecvError(std::io::Error),
    RecvMissingSourceAddr,
    RecvMissingAncillaryData,
    SendError(std::io::Error),
}

// ===== impl Error =====

impl Error {
    pub(crate) fn log(&self) {
        match self {
            Error::IoError(error) => {
                error.log();
            }
            Error::InterfaceStartError(name, error) => {
                error!(%name, error = %with_source(error), "{}", self);
            }
            Error::InterfaceNotFound(ifindex) => {
                warn!(%ifindex, "{}", self);
            }
            Error::PacketDecodeError(ifindex, src, error) => {
                warn_span!("network").in_scope(|| {
                    warn!(%ifindex, %src, %error, "{}", self);
                });
            }
            Error::NoHelloNeighbor(ifindex, src) => {
                warn!(%ifindex, %src, "{}", self);
            }
            Error::JpConflictingEntry(source, group) => {
                error!(%source, %group, "{}", self);
            }
            Error::MribBadNextHop(addr, next_hop) => {
                warn!(%addr, %next_hop, "{}", self);
            }
            Error::MfcInstallError(source, group) => {
                warn!(%source, %group, "{}", self);
            }
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(error) => error.fmt(f),
            Error::InterfaceStartError(..) => {
                write!(f, "failed to start interface")
            }
            Error::InterfaceNotFound(..) => {
                write!(f, "interface not found")
            }
            Error::PacketDecodeError(..) => {
                write!(f, "failed to decode packet")
            }
            Error::NoHelloNeighbor(..) => {
                write!(f, "message from a neighbor without Hello state")
            }
            Error::JpConflictingEntry(..) => {
                write!(f, "conflicting Join and Prune for the same entry")
            }
            Error::MribBadNextHop(..) => {
                write!(f, "MRIB next-hop is not on a local interface")
            }
            Error::MfcInstallError(..) => {
                write!(f, "failed to install forwarding entry")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(error) => Some(error),
            Error::InterfaceStartError(_, error) => Some(error),
            Error::PacketDecodeError(_, _, error) => Some(error),
            _ => None,
        }
    }
}

impl From<IoError> for Error {
    fn from(error: IoError) -> Error {
        Error::IoError(error)
    }
}

// ===== impl IoError =====

impl IoError {
    pub(crate) fn log(&self) {
        match self {
            IoError::SocketError(error)
            | IoError::MulticastJoinError(error)
            | IoError::RecvError(error)
            | IoError::SendError(error) => {
                warn!(error = %with_source(error), "{}", self);
            }
            IoError::RecvMissingSourceAddr
            | IoError::RecvMissingAncillaryData => {
                warn!("{}", self);
            }
        }
    }
}

impl std::fmt::Display for IoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IoError::SocketError(..) => {
                write!(f, "failed to create raw socket")
            }
            IoError::MulticastJoinError(..) => {
                write!(f, "failed to join multicast group")
            }
            IoError::RecvError(..) => {
                write!(f, "failed to receive packet")
            }
            IoError::RecvMissingSourceAddr => {
                write!(f, "missing source address in received packet")
            }
            IoError::RecvMissingAncillaryData => {
                write!(f, "missing ancillary data in received packet")
            }
            IoError::SendError(..) => {
                write!(f, "failed to send packet")
            }
        }
    }
}

impl std::error::Error for IoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IoError::SocketError(error)
            | IoError::MulticastJoinError(error)
            | IoError::RecvError(error)
            | IoError::SendError(error) => Some(error),
            _ => None,
        }
    }
}

// ===== global functions =====

fn with_source<E: std::error::Error>(error: E) -> String {
    if let Some(source) = error.source() {
        format!("{} ({})", error, with_source(source))
    } else {
        error.to_string()
    }
}
