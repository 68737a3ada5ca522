use junction::{Junction, Kcall, Param, Resource};

#[test]
fn closed_writer_terminates_the_reader() {
    let junction = Junction::new().expect("junction");
    let (input, output) =
        Junction::rallocate(&["octets", "spawn", "unidirectional"], Param::None)
            .expect("allocate")
            .into_pair()
            .expect("pair");

    junction.acquire(&input).expect("attach");
    input.acquire(Resource::Octets(vec![0u8; 16])).expect("buffer");

    // Close the write side outside the loop.
    output.terminate();

    let mut terminated = false;
    for _ in 0..4 {
        junction.enter().expect("enter");
        for chan in junction.transfer() {
            if chan == input && chan.event_terminate() {
                terminated = true;
            }
        }
        junction.exit();
        if terminated {
            break;
        }
    }

    assert!(terminated);
    assert_eq!(input.port().call(), Kcall::Eof);
    assert!(input.terminated());
    assert!(!input.port().latched(), "descriptor released at flush");
    assert!(junction.resource().is_empty(), "reader left the ring");
}

#[test]
fn written_bytes_transfer_to_the_reader() {
    let junction = Junction::new().expect("junction");
    let (input, output) =
        Junction::rallocate(&["octets", "spawn", "unidirectional"], Param::None)
            .expect("allocate")
            .into_pair()
            .expect("pair");

    junction.acquire(&input).expect("attach");
    input.acquire(Resource::Octets(vec![0u8; 16])).expect("buffer");

    let wfd = output.port().id();
    let wrote = unsafe { libc::write(wfd, b"tail".as_ptr() as *const libc::c_void, 4) };
    assert_eq!(wrote, 4);

    let mut collected = Vec::new();
    for _ in 0..4 {
        junction.enter().expect("enter");
        for chan in junction.transfer() {
            if let Some(transfer) = chan.transfer() {
                collected.extend(transfer.octets().expect("octets"));
            }
        }
        junction.exit();
        if !collected.is_empty() {
            break;
        }
    }

    assert_eq!(collected, b"tail");
    output.terminate();
}
