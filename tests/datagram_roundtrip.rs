use std::net::Ipv4Addr;

use junction::{DatagramArray, Endpoint, Family, Junction, Param, Resource};

fn bound_pair(port: u16) -> (junction::Channel, junction::Channel) {
    Junction::rallocate(
        &["datagrams", "ip4"],
        Param::Endpoint(Endpoint::v4(Ipv4Addr::LOCALHOST, port)),
    )
    .expect("allocate")
    .into_pair()
    .expect("pair")
}

#[test]
fn datagram_round_trip() {
    let junction = Junction::new().expect("junction");

    let (sender_in, sender_out) = bound_pair(0);
    let (receiver_in, receiver_out) = bound_pair(0);

    junction.acquire(&sender_out).expect("attach sender");
    junction.acquire(&receiver_in).expect("attach receiver");

    let sender_bound = sender_in.endpoint().expect("sender bound address");
    let receiver_bound = receiver_in.endpoint().expect("receiver bound address");
    assert_ne!(sender_bound.port(), receiver_bound.port());

    let outgoing = DatagramArray::new(Family::Ip4, 512, 4).expect("array");
    outgoing.set_endpoint(0, &receiver_bound).expect("address");
    outgoing.set_payload(0, b"ping").expect("payload");
    let incoming = DatagramArray::new(Family::Ip4, 512, 4).expect("array");

    // Send only the addressed record; the slice aliases the array.
    sender_out
        .acquire(Resource::Datagrams(outgoing.slice(0..1)))
        .expect("send buffer");
    receiver_in
        .acquire(Resource::Datagrams(incoming.clone()))
        .expect("receive buffer");

    let mut received = None;
    for _ in 0..6 {
        junction.enter().expect("enter");
        for chan in junction.transfer() {
            if chan == receiver_in {
                if let Some(transfer) = chan.transfer() {
                    let grams = transfer.datagrams().expect("datagram transfer");
                    if !grams.is_empty() {
                        received = Some(grams);
                    }
                }
            }
        }
        junction.exit();
        if received.is_some() {
            break;
        }
    }

    let received = received.expect("received datagrams");
    assert_eq!(received.len(), 1);

    let payload = received.payload(0).expect("payload");
    assert_eq!(payload.len(), 512, "payload covers the record space");
    assert_eq!(&payload[..4], b"ping");

    let source = received.endpoint(0).expect("source endpoint");
    assert_eq!(source, sender_bound);

    // The transfer aliases the acquired array.
    assert_eq!(&incoming.payload(0).expect("slot 0")[..4], b"ping");

    drop((sender_in, receiver_out));
}
