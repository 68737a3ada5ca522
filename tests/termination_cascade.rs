use junction::{Junction, Param, Resource, Violation};

#[test]
fn termination_cascades_over_the_ring() {
    let junction = Junction::new().expect("junction");

    let mut readers = Vec::new();
    let mut writers = Vec::new();
    for _ in 0..100 {
        let (input, output) =
            Junction::rallocate(&["octets", "spawn", "unidirectional"], Param::None)
                .expect("allocate")
                .into_pair()
                .expect("pair");
        junction.acquire(&input).expect("attach");
        input.acquire(Resource::Octets(vec![0u8; 4])).expect("buffer");
        readers.push(input);
        writers.push(output);
    }
    assert_eq!(junction.resource().len(), 100);

    junction.terminate();
    assert!(junction.terminating());

    let mut termination_events = 0;
    for _ in 0..4 {
        junction.enter().expect("enter");
        for chan in junction.transfer() {
            if chan.event_terminate() {
                termination_events += 1;
            }
        }
        junction.exit();
        if junction.resource().is_empty() {
            break;
        }
    }

    assert_eq!(termination_events, 100, "one termination event per channel");
    assert!(junction.resource().is_empty());
    // The junction's own termination is observable only after the ring
    // emptied.
    assert!(junction.event_terminate());
    assert!(junction.terminated());

    for reader in &readers {
        assert!(reader.terminated());
        assert!(!reader.port().latched(), "descriptor closed");
    }

    assert_eq!(junction.enter().err(), Some(Violation::Terminated));

    for writer in &writers {
        writer.terminate();
    }
}

#[test]
fn void_disclaims_the_ring_without_events() {
    let junction = Junction::new().expect("junction");
    let (input, output) =
        Junction::rallocate(&["octets", "spawn", "unidirectional"], Param::None)
            .expect("allocate")
            .into_pair()
            .expect("pair");
    junction.acquire(&input).expect("attach");

    junction.void();

    assert!(junction.resource().is_empty());
    assert!(!input.port().latched());
    assert_eq!(input.port().call(), junction::Kcall::Void);
    assert!(!junction.terminating(), "void is not termination");

    // A voided junction re-initializes its notification handle on the next
    // cycle and remains usable: a freshly attached channel subscribes and
    // transfers as usual.
    let (reader, writer) =
        Junction::rallocate(&["octets", "spawn", "unidirectional"], Param::None)
            .expect("allocate")
            .into_pair()
            .expect("pair");
    junction.acquire(&reader).expect("attach after void");
    reader.acquire(Resource::Octets(vec![0u8; 4])).expect("buffer");
    let wfd = writer.port().id();
    let wrote = unsafe { libc::write(wfd, b"ok".as_ptr() as *const libc::c_void, 2) };
    assert_eq!(wrote, 2);

    let mut collected = Vec::new();
    for _ in 0..4 {
        junction.enter().expect("re-initialized cycle");
        for chan in junction.transfer() {
            if let Some(transfer) = chan.transfer() {
                collected = transfer.octets().expect("octets");
            }
        }
        junction.exit();
        if !collected.is_empty() {
            break;
        }
    }
    assert_eq!(collected, b"ok");

    writer.terminate();
    output.terminate();
}
