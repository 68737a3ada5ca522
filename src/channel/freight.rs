//! Freight dispatch: the payload kind a channel carries.
//!
//! Each variant binds the pair of transfer drivers and the unit size that
//! projects the byte window onto user-visible indices. The variant is chosen
//! at construction and never changes.

use std::os::unix::io::RawFd;

use crate::channel::Resource;
use crate::datagram::{self, DatagramArray};
use crate::endpoint::Family;
use crate::port::{IoStatus, Polarity, Port};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Freight {
    Octets,
    Sockets,
    Ports,
    Datagrams { family: Family },
}

impl Freight {
    pub(crate) fn identifier(&self) -> &'static str {
        match self {
            Freight::Octets => "octets",
            Freight::Sockets => "sockets",
            Freight::Ports => "ports",
            Freight::Datagrams { .. } => "datagrams",
        }
    }

    /// Drive one transfer attempt over `[stop, resource end)`.
    ///
    /// Returns the bytes moved and the resulting status. The byte count is
    /// what extends the channel's window stop.
    pub(crate) fn attempt(
        &self,
        port: &Port,
        polarity: Polarity,
        resource: &mut Resource,
        stop: usize,
    ) -> (usize, IoStatus) {
        match (self, resource) {
            (Freight::Octets, Resource::Octets(buf)) => match polarity {
                Polarity::Input => port.input_octets(&mut buf[stop..]),
                Polarity::Output => port.output_octets(&buf[stop..]),
            },
            (Freight::Sockets, Resource::Fds(fds)) => {
                let index = stop / std::mem::size_of::<RawFd>();
                match polarity {
                    Polarity::Input => port.input_sockets(&mut fds[index..]),
                    // Listener channels are input-only.
                    Polarity::Output => (0, IoStatus::Stop),
                }
            }
            (Freight::Ports, Resource::Fds(fds)) => {
                let index = stop / std::mem::size_of::<RawFd>();
                match polarity {
                    Polarity::Input => port.input_ports(&mut fds[index..]),
                    Polarity::Output => port.output_ports(&fds[index..]),
                }
            }
            (Freight::Datagrams { .. }, Resource::Datagrams(dga)) => {
                datagram_attempt(port, polarity, dga, stop)
            }
            // Resource shape does not match the freight; nothing can move.
            _ => (0, IoStatus::Stop),
        }
    }
}

fn datagram_attempt(
    port: &Port,
    polarity: Polarity,
    dga: &DatagramArray,
    start: usize,
) -> (usize, IoStatus) {
    let unit = dga.unit();
    let cap = dga.addr_capacity();
    let space = dga.space();

    dga.with_region(|bytes| {
        let mut offset = start;

        while offset + unit <= bytes.len() {
            let record = &mut bytes[offset..offset + unit];
            let (header, rest) = record.split_at_mut(datagram::HEADER);
            let (addr, payload) = rest.split_at_mut(cap);

            match polarity {
                Polarity::Input => match port.input_datagram(addr, &mut payload[..space]) {
                    Ok(addrlen) => {
                        header[0..4].copy_from_slice(&(addrlen as u32).to_ne_bytes());
                    }
                    Err(status) => return (offset - start, status),
                },
                Polarity::Output => {
                    let addrlen =
                        u32::from_ne_bytes(header[0..4].try_into().unwrap()) as usize;
                    let addrlen = addrlen.min(cap);
                    if let Err(status) = port.output_datagram(addr, addrlen, &payload[..space]) {
                        return (offset - start, status);
                    }
                }
            }

            offset += unit;
        }

        (offset - start, IoStatus::Flow)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mismatched_resource_moves_nothing() {
        let port = Port::untethered();
        let mut resource = Resource::Octets(vec![0u8; 8]);
        let freight = Freight::Sockets;
        assert_eq!(
            freight.attempt(&port, Polarity::Input, &mut resource, 0),
            (0, IoStatus::Stop)
        );
    }

    #[test]
    fn zero_remainder_flows_without_a_syscall() {
        let port = Port::untethered();
        let mut resource = Resource::Octets(Vec::new());
        assert_eq!(
            Freight::Octets.attempt(&port, Polarity::Input, &mut resource, 0),
            (0, IoStatus::Flow)
        );
    }
}
