use junction::{Junction, Param, Resource};

fn fd_is_open(fd: i32) -> bool {
    (unsafe { libc::fcntl(fd, libc::F_GETFD) }) != -1
}

#[test]
fn descriptors_pass_between_socketpair_halves() {
    let junction = Junction::new().expect("junction");
    let (in_a, out_a, in_b, out_b) =
        Junction::rallocate(&["ports", "spawn", "bidirectional"], Param::None)
            .expect("allocate")
            .into_quad()
            .expect("quad");

    // Something to pass: the read end of a fresh pipe.
    let mut pipe_fds = [0i32; 2];
    assert_eq!(unsafe { libc::pipe(pipe_fds.as_mut_ptr()) }, 0);

    junction.acquire(&out_a).expect("attach sender");
    junction.acquire(&in_b).expect("attach receiver");

    out_a.acquire(Resource::Fds(vec![pipe_fds[0]])).expect("send slot");
    in_b.acquire(Resource::Fds(vec![-1])).expect("receive slot");

    let mut passed = Vec::new();
    for _ in 0..4 {
        junction.enter().expect("enter");
        for chan in junction.transfer() {
            if chan == in_b {
                if let Some(transfer) = chan.transfer() {
                    passed = transfer.fds().expect("descriptor transfer");
                }
            }
        }
        junction.exit();
        if !passed.is_empty() {
            break;
        }
    }

    assert_eq!(passed.len(), 1);
    let received = passed[0];
    assert_ne!(received, pipe_fds[0], "the kernel duplicates the descriptor");
    assert!(fd_is_open(received));

    unsafe {
        libc::close(received);
        libc::close(pipe_fds[0]);
        libc::close(pipe_fds[1]);
    }
    drop((in_a, out_b));
}
