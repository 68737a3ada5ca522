//! Channel allocation requests.
//!
//! Requests are addressed by a closed set of token tuples (`["octets",
//! "ip4", "tcp"]`) or the equivalent IRI strings (`"octets://ip4:tcp"`,
//! `"octets://spawn/bidirectional"`); both resolve through the same
//! dispatch. Kernel failures during allocation do not fail the request:
//! the returned channels carry errored ports and terminate through their
//! first cycle.

use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::channel::{Channel, ChannelCore, Freight};
use crate::endpoint::{Endpoint, Family};
use crate::error::Violation;
use crate::port::{Polarity, Port};

const DEFAULT_BACKLOG: libc::c_int = 128;

/// Parameters accompanying an allocation request.
#[derive(Debug)]
pub enum Param {
    None,
    /// Connect, bind, or listen address.
    Endpoint(Endpoint),
    /// `(connect, bind)` for locally bound connects.
    Pair(Endpoint, Endpoint),
    /// File path for file-backed channels.
    Path(PathBuf),
    /// An existing descriptor to acquire.
    Fd(RawFd),
}

impl Param {
    fn endpoint(&self) -> Result<&Endpoint, Violation> {
        match self {
            Param::Endpoint(e) => Ok(e),
            _ => Err(Violation::InvalidParameter),
        }
    }

    fn pair(&self) -> Result<(&Endpoint, &Endpoint), Violation> {
        match self {
            Param::Pair(connect, bind) => Ok((connect, bind)),
            _ => Err(Violation::InvalidParameter),
        }
    }

    fn path(&self) -> Result<&Path, Violation> {
        match self {
            Param::Path(p) => Ok(p),
            Param::Endpoint(Endpoint::Local(p)) => Ok(p),
            _ => Err(Violation::InvalidParameter),
        }
    }

    fn fd(&self) -> Result<RawFd, Violation> {
        match self {
            Param::Fd(fd) => Ok(*fd),
            _ => Err(Violation::InvalidParameter),
        }
    }
}

/// Channels produced by an allocation request.
#[derive(Debug)]
pub enum Allocation {
    Input(Channel),
    Output(Channel),
    /// Input and output halves over one descriptor or a pipe pair.
    Pair { input: Channel, output: Channel },
    /// Both halves of both ends of a bidirectional spawn:
    /// `(input_a, output_a, input_b, output_b)`.
    Quad(Channel, Channel, Channel, Channel),
}

impl Allocation {
    pub fn into_input(self) -> Option<Channel> {
        match self {
            Allocation::Input(c) => Some(c),
            _ => None,
        }
    }

    pub fn into_output(self) -> Option<Channel> {
        match self {
            Allocation::Output(c) => Some(c),
            _ => None,
        }
    }

    pub fn into_pair(self) -> Option<(Channel, Channel)> {
        match self {
            Allocation::Pair { input, output } => Some((input, output)),
            _ => None,
        }
    }

    pub fn into_quad(self) -> Option<(Channel, Channel, Channel, Channel)> {
        match self {
            Allocation::Quad(a, b, c, d) => Some((a, b, c, d)),
            _ => None,
        }
    }

    /// Every allocated channel, in allocation order.
    pub fn channels(&self) -> Vec<Channel> {
        match self {
            Allocation::Input(c) | Allocation::Output(c) => vec![c.clone()],
            Allocation::Pair { input, output } => vec![input.clone(), output.clone()],
            Allocation::Quad(a, b, c, d) => {
                vec![a.clone(), b.clone(), c.clone(), d.clone()]
            }
        }
    }
}

fn family_token(token: &str) -> Option<(Family, libc::c_int)> {
    match token {
        "ip4" => Some((Family::Ip4, libc::AF_INET)),
        "ip6" => Some((Family::Ip6, libc::AF_INET6)),
        "local" => Some((Family::Local, libc::AF_UNIX)),
        _ => None,
    }
}

fn lower(endpoint: &Endpoint, family: Family) -> Result<crate::endpoint::SockAddr, Violation> {
    if endpoint.family() != family {
        return Err(Violation::InvalidParameter);
    }
    endpoint.to_sockaddr().ok_or(Violation::InvalidParameter)
}

fn shared_pair(freight: Freight) -> (Arc<Port>, Channel, Channel) {
    let port = Arc::new(Port::untethered());
    port.latch_both();
    let input = Channel::from_core(ChannelCore::new(
        Polarity::Input,
        Arc::clone(&port),
        freight,
    ));
    let output = Channel::from_core(ChannelCore::new(
        Polarity::Output,
        Arc::clone(&port),
        freight,
    ));
    (port, input, output)
}

fn single(polarity: Polarity, freight: Freight) -> (Arc<Port>, Channel) {
    let port = Arc::new(Port::untethered());
    port.latch(polarity);
    let chan = Channel::from_core(ChannelCore::new(polarity, Arc::clone(&port), freight));
    (port, chan)
}

fn connected_octets(
    family: Family,
    af: libc::c_int,
    typ: libc::c_int,
    proto: libc::c_int,
    connect: &Endpoint,
    bind: Option<&Endpoint>,
) -> Result<Allocation, Violation> {
    let connect = lower(connect, family)?;
    let bind = bind.map(|b| lower(b, family)).transpose()?;

    let (port, input, output) = shared_pair(Freight::Octets);
    if port.open_socket(af, typ, proto) {
        match bind {
            Some(bind) => {
                port.bind_connect(&connect, &bind);
            }
            None => {
                port.connect(&connect);
            }
        }
    }
    Ok(Allocation::Pair { input, output })
}

fn listening_sockets(family: Family, af: libc::c_int, listen: &Endpoint) -> Result<Allocation, Violation> {
    let typ = libc::SOCK_STREAM;
    let addr = lower(listen, family)?;

    let (port, input) = single(Polarity::Input, Freight::Sockets);
    if port.open_socket(af, typ, 0) && port.bind(&addr) {
        port.listen(DEFAULT_BACKLOG);
    }
    Ok(Allocation::Input(input))
}

fn bound_datagrams(family: Family, af: libc::c_int, bind: &Endpoint) -> Result<Allocation, Violation> {
    let addr = lower(bind, family)?;

    let (port, input, output) = shared_pair(Freight::Datagrams { family });
    if port.open_socket(af, libc::SOCK_DGRAM, libc::IPPROTO_UDP) {
        port.bind(&addr);
    }
    Ok(Allocation::Pair { input, output })
}

fn spawned_pipe() -> Allocation {
    let (in_port, input) = single(Polarity::Input, Freight::Octets);
    let (out_port, output) = single(Polarity::Output, Freight::Octets);
    Port::pipe(&in_port, &out_port);
    Allocation::Pair { input, output }
}

fn spawned_socketpair(freight: Freight) -> Allocation {
    let (port_a, input_a, output_a) = shared_pair(freight);
    let (port_b, input_b, output_b) = shared_pair(freight);
    Port::socketpair(&port_a, &port_b);
    Allocation::Quad(input_a, output_a, input_b, output_b)
}

fn acquired_pair(freight: Freight, fd: RawFd) -> Allocation {
    let (port, input, output) = shared_pair(freight);
    port.acquire(fd);
    Allocation::Pair { input, output }
}

fn acquired_single(polarity: Polarity, freight: Freight, fd: RawFd) -> Allocation {
    let (port, chan) = single(polarity, freight);
    port.acquire(fd);
    match polarity {
        Polarity::Input => Allocation::Input(chan),
        Polarity::Output => Allocation::Output(chan),
    }
}

fn file_octets(mode: &str, path: &Path) -> Result<Allocation, Violation> {
    let (polarity, flags) = match mode {
        "read" => (Polarity::Input, libc::O_RDONLY | libc::O_CREAT | libc::O_CLOEXEC),
        "overwrite" => (
            Polarity::Output,
            libc::O_WRONLY | libc::O_CREAT | libc::O_CLOEXEC,
        ),
        "append" => (
            Polarity::Output,
            libc::O_WRONLY | libc::O_APPEND | libc::O_CREAT | libc::O_CLOEXEC,
        ),
        _ => return Err(Violation::UnknownResourceType),
    };

    let (port, chan) = single(polarity, Freight::Octets);
    if port.open_file(path, flags) {
        // Regular files never report readiness; they transfer on request.
        if matches!(port.kind(), crate::port::Kind::File | crate::port::Kind::Device) {
            chan.core.prime_requeue();
        }
    }
    Ok(match polarity {
        Polarity::Input => Allocation::Input(chan),
        Polarity::Output => Allocation::Output(chan),
    })
}

/// Resolve a token-tuple request.
pub(crate) fn rallocate(tokens: &[&str], param: Param) -> Result<Allocation, Violation> {
    match tokens {
        ["octets", domain @ ("ip4" | "ip6")] | ["octets", domain @ ("ip4" | "ip6"), "tcp"] => {
            let (family, af) = family_token(domain).unwrap();
            connected_octets(
                family,
                af,
                libc::SOCK_STREAM,
                libc::IPPROTO_TCP,
                param.endpoint()?,
                None,
            )
        }
        ["octets", domain @ ("ip4" | "ip6"), "udp"] => {
            let (family, af) = family_token(domain).unwrap();
            connected_octets(
                family,
                af,
                libc::SOCK_DGRAM,
                libc::IPPROTO_UDP,
                param.endpoint()?,
                None,
            )
        }
        ["octets", domain @ ("ip4" | "ip6"), proto @ ("tcp" | "udp"), "bind"] => {
            let (family, af) = family_token(domain).unwrap();
            let (typ, proto) = match *proto {
                "tcp" => (libc::SOCK_STREAM, libc::IPPROTO_TCP),
                _ => (libc::SOCK_DGRAM, libc::IPPROTO_UDP),
            };
            let (connect, bind) = param.pair()?;
            connected_octets(family, af, typ, proto, connect, Some(bind))
        }
        ["octets", "local"] => {
            let path = param.path()?;
            connected_octets(
                Family::Local,
                libc::AF_UNIX,
                libc::SOCK_STREAM,
                0,
                &Endpoint::local(path),
                None,
            )
        }
        ["sockets", domain @ ("ip4" | "ip6" | "local")] => {
            let (family, af) = family_token(domain).unwrap();
            let endpoint = match family {
                Family::Local => Endpoint::local(param.path()?),
                _ => param.endpoint()?.clone(),
            };
            listening_sockets(family, af, &endpoint)
        }
        ["sockets", "acquire"] | ["sockets", "acquire", "socket"] => Ok(acquired_single(
            Polarity::Input,
            Freight::Sockets,
            param.fd()?,
        )),
        ["octets", "acquire", "socket"] => Ok(acquired_pair(Freight::Octets, param.fd()?)),
        ["octets", "acquire", "input"] => Ok(acquired_single(
            Polarity::Input,
            Freight::Octets,
            param.fd()?,
        )),
        ["octets", "acquire", "output"] => Ok(acquired_single(
            Polarity::Output,
            Freight::Octets,
            param.fd()?,
        )),
        ["octets", "spawn", "unidirectional"] => Ok(spawned_pipe()),
        ["octets", "spawn", "bidirectional"] => Ok(spawned_socketpair(Freight::Octets)),
        ["octets", "file", mode] => file_octets(mode, param.path()?),
        ["datagrams", domain @ ("ip4" | "ip6")]
        | ["datagrams", domain @ ("ip4" | "ip6"), "udp"] => {
            let (family, af) = family_token(domain).unwrap();
            bound_datagrams(family, af, param.endpoint()?)
        }
        ["ports", "spawn", "bidirectional"] => Ok(spawned_socketpair(Freight::Ports)),
        ["ports", "acquire"] | ["ports", "acquire", "socket"] => {
            Ok(acquired_pair(Freight::Ports, param.fd()?))
        }
        _ => Err(Violation::UnknownResourceType),
    }
}

/// Split an IRI-form request (`"octets://ip4:tcp"`, `"octets://spawn/bidirectional"`)
/// into its tokens.
pub(crate) fn iri_tokens(request: &str) -> Result<Vec<&str>, Violation> {
    let (scheme, rest) = request
        .split_once("://")
        .ok_or(Violation::UnknownResourceType)?;
    let mut tokens = vec![scheme];
    for part in rest.split(['/', ':']) {
        if !part.is_empty() {
            tokens.push(part);
        }
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::Kind;
    use std::net::Ipv4Addr;

    #[test]
    fn iri_forms_resolve_to_token_tuples() {
        assert_eq!(
            iri_tokens("octets://ip4:tcp").expect("parse"),
            vec!["octets", "ip4", "tcp"]
        );
        assert_eq!(
            iri_tokens("octets://spawn/bidirectional").expect("parse"),
            vec!["octets", "spawn", "bidirectional"]
        );
        assert_eq!(iri_tokens("sockets://ip4").expect("parse"), vec!["sockets", "ip4"]);
        assert!(iri_tokens("no-scheme").is_err());
    }

    #[test]
    fn unknown_tuples_are_refused() {
        assert_eq!(
            rallocate(&["wolves", "ip4"], Param::None).err(),
            Some(Violation::UnknownResourceType)
        );
        assert_eq!(
            rallocate(&["octets", "ip4", "sctp"], Param::None).err(),
            Some(Violation::UnknownResourceType)
        );
    }

    #[test]
    fn mismatched_parameters_are_refused() {
        assert_eq!(
            rallocate(&["octets", "ip4"], Param::None).err(),
            Some(Violation::InvalidParameter)
        );
        // ip6 request with an ip4 address.
        assert_eq!(
            rallocate(
                &["octets", "ip6"],
                Param::Endpoint(Endpoint::v4(Ipv4Addr::LOCALHOST, 80))
            )
            .err(),
            Some(Violation::InvalidParameter)
        );
    }

    #[test]
    fn spawned_pipe_yields_latched_halves() {
        let (input, output) = rallocate(&["octets", "spawn", "unidirectional"], Param::None)
            .expect("allocate")
            .into_pair()
            .expect("pair");

        assert_eq!(input.polarity(), Polarity::Input);
        assert_eq!(output.polarity(), Polarity::Output);
        assert_eq!(input.port().kind(), Kind::Pipe);
        assert!(input.port().latched());

        input.terminate();
        output.terminate();
    }

    #[test]
    fn spawned_socketpair_yields_four_channels_over_two_ports() {
        let (i1, o1, i2, o2) = rallocate(&["octets", "spawn", "bidirectional"], Param::None)
            .expect("allocate")
            .into_quad()
            .expect("quad");

        assert_eq!(i1.port().id(), o1.port().id());
        assert_ne!(i1.port().id(), i2.port().id());
        assert_eq!(i2.port().id(), o2.port().id());

        for c in [i1, o1, i2, o2] {
            c.terminate();
        }
    }

    #[test]
    fn allocation_failure_is_carried_on_the_port() {
        // Connecting to an ip4 endpoint over ip6 fails at the syscall layer
        // without failing the request.
        let allocation = rallocate(
            &["octets", "local"],
            Param::Path(PathBuf::from("/nonexistent/deeply/nested.sock")),
        )
        .expect("allocate");
        let (input, output) = allocation.into_pair().expect("pair");

        assert!(input.port().errored());
        assert!(input.port().raised().is_err());
        input.terminate();
        output.terminate();
    }
}
