use junction::{Junction, Param, Resource, Violation};

#[test]
fn a_cycle_cannot_open_inside_a_cycle() {
    let junction = Junction::new().expect("junction");

    // Queue a wake so the empty junction's cycles return immediately
    // instead of blocking out the kernel wait.
    junction.force();
    junction.enter().expect("first");
    assert_eq!(junction.enter().err(), Some(Violation::CycleOpen));
    junction.exit();

    // Closed: a fresh cycle opens again.
    junction.force();
    junction.enter().expect("second");
    junction.exit();
}

#[test]
fn the_scratch_array_cannot_resize_inside_a_cycle() {
    let junction = Junction::new().expect("junction");

    assert_eq!(junction.resize_exoresource(64), Ok(64));

    junction.force();
    junction.enter().expect("enter");
    assert_eq!(junction.resize_exoresource(32), Err(Violation::Cycling));
    junction.exit();

    assert_eq!(junction.resize_exoresource(32), Ok(32));
}

#[test]
fn a_channel_belongs_to_one_junction_for_life() {
    let first = Junction::new().expect("first junction");
    let second = Junction::new().expect("second junction");
    let (input, output) =
        Junction::rallocate(&["octets", "spawn", "unidirectional"], Param::None)
            .expect("allocate")
            .into_pair()
            .expect("pair");

    first.acquire(&input).expect("first attach");
    // Re-acquisition by the owner is a no-op.
    first.acquire(&input).expect("re-attach");
    assert_eq!(second.acquire(&input).err(), Some(Violation::ForeignChannel));

    output.terminate();
}

#[test]
fn terminated_channels_cannot_attach() {
    let junction = Junction::new().expect("junction");
    let (input, output) =
        Junction::rallocate(&["octets", "spawn", "unidirectional"], Param::None)
            .expect("allocate")
            .into_pair()
            .expect("pair");

    input.terminate();
    assert_eq!(junction.acquire(&input).err(), Some(Violation::Terminated));

    output.terminate();
}

#[test]
fn a_held_resource_blocks_reacquisition_until_exhaust() {
    let junction = Junction::new().expect("junction");
    let (input, output) =
        Junction::rallocate(&["octets", "spawn", "unidirectional"], Param::None)
            .expect("allocate")
            .into_pair()
            .expect("pair");
    junction.acquire(&input).expect("attach");

    input.acquire(Resource::Octets(vec![0u8; 4])).expect("first");
    assert_eq!(
        input.acquire(Resource::Octets(vec![0u8; 4])).err(),
        Some(Violation::ResourceHeld)
    );

    // Fill the pipe so the buffer exhausts.
    let wfd = output.port().id();
    let wrote = unsafe { libc::write(wfd, b"full".as_ptr() as *const libc::c_void, 4) };
    assert_eq!(wrote, 4);

    let mut exhausted = false;
    for _ in 0..4 {
        junction.enter().expect("enter");
        for chan in junction.transfer() {
            exhausted |= chan.event_transfer() && chan.exhausted();
        }
        junction.exit();
        if exhausted {
            break;
        }
    }
    assert!(exhausted);

    // The exhaust event re-opens acquisition.
    input.acquire(Resource::Octets(vec![0u8; 4])).expect("second");

    input.terminate();
    output.terminate();
}
