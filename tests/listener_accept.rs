use std::net::{Ipv4Addr, TcpStream};

use junction::{Endpoint, Junction, Param, Resource};

#[test]
fn listener_accepts_a_connection() {
    let junction = Junction::new().expect("junction");
    let listener = Junction::rallocate(
        &["sockets", "ip4"],
        Param::Endpoint(Endpoint::v4(Ipv4Addr::LOCALHOST, 0)),
    )
    .expect("allocate")
    .into_input()
    .expect("input channel");

    junction.acquire(&listener).expect("attach");

    let bound = listener.endpoint().expect("bound endpoint");
    let port = bound.port().expect("bound port");
    assert_ne!(port, 0);

    let client = TcpStream::connect(("127.0.0.1", port)).expect("connect");

    listener.acquire(Resource::Fds(vec![-1])).expect("slots");

    let mut accepted = Vec::new();
    for _ in 0..4 {
        junction.enter().expect("enter");
        for chan in junction.transfer() {
            if let Some(transfer) = chan.transfer() {
                accepted = transfer.fds().expect("descriptor transfer");
            }
        }
        junction.exit();
        if !accepted.is_empty() {
            break;
        }
    }

    assert_eq!(accepted.len(), 1);
    assert!(accepted[0] >= 0);
    assert_eq!(listener.sizeof_transfer(), 0, "events clear after the cycle");

    unsafe { libc::close(accepted[0]) };
    drop(client);
}

#[test]
fn listener_endpoint_round_trips_through_string_form() {
    let listener = Junction::rallocate(
        &["sockets", "ip4"],
        Param::Endpoint(Endpoint::v4(Ipv4Addr::LOCALHOST, 0)),
    )
    .expect("allocate")
    .into_input()
    .expect("input channel");

    let bound = listener.endpoint().expect("bound endpoint");
    let reparsed: Endpoint = bound.to_string().parse().expect("re-parse");
    assert_eq!(reparsed, bound);

    listener.terminate();
}
