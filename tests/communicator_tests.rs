use mesh_distributor::algs::communicator::{CommTag, Communicator, LocalComm, NoComm, Wait};

mod util;
use util::run_ranks;

#[test]
fn local_round_trip() {
    let tag = CommTag(0x1000);
    let comms = LocalComm::group(2);

    let msg = b"hello";
    comms[0].isend(1, tag.as_u16(), msg);

    let mut buf = [0u8; 5];
    let h = comms[1].irecv(0, tag.as_u16(), &mut buf);
    let got = h.wait().unwrap();
    assert_eq!(&got, msg);
}

#[test]
fn local_fifo_order() {
    let tag = CommTag(0x1001);
    let comms = LocalComm::group(2);

    for i in 0..10u8 {
        comms[0].isend(1, tag.as_u16(), &[i]);
    }
    let mut out = Vec::new();
    for _ in 0..10 {
        let mut b = [0u8; 1];
        let h = comms[1].irecv(0, tag.as_u16(), &mut b);
        out.push(h.wait().unwrap()[0]);
    }
    assert_eq!(out, (0u8..10u8).collect::<Vec<_>>());
}

#[test]
fn oversized_message_is_not_truncated() {
    let tag = CommTag(0x1002);
    let comms = LocalComm::group(2);

    comms[0].isend(1, tag.as_u16(), &[1, 2, 3, 4, 5, 6]);
    let mut b = [0u8; 4];
    let got = comms[1].irecv(0, tag.as_u16(), &mut b).wait().unwrap();
    assert_eq!(got, vec![1, 2, 3, 4, 5, 6]);
}

#[test]
fn tags_do_not_cross_match() {
    let comms = LocalComm::group(2);
    comms[0].isend(1, 1, b"one");
    comms[0].isend(1, 2, b"two");
    let mut b = [0u8; 3];
    let two = comms[1].irecv(0, 2, &mut b);
    let one = comms[1].irecv(0, 1, &mut b);
    assert_eq!(two.wait().unwrap(), b"two");
    assert_eq!(one.wait().unwrap(), b"one");
}

#[test]
fn all_to_all_counts_transposes() {
    let got = run_ranks(4, |comm| {
        let me = comm.rank() as u64;
        let counts: Vec<u64> = (0..4).map(|p| me * 10 + p).collect();
        comm.all_to_all_counts(&counts).unwrap()
    });
    for (r, row) in got.iter().enumerate() {
        let want: Vec<u64> = (0..4).map(|p| p * 10 + r as u64).collect();
        assert_eq!(row, &want);
    }
}

#[test]
fn barrier_and_blocking_sends_complete() {
    let got = run_ranks(3, |comm| {
        let me = comm.rank();
        let next = (me + 1) % 3;
        let prev = (me + 2) % 3;
        let mut buf = [0u8; 1];
        let h = comm.irecv(prev, 9, &mut buf);
        comm.barrier().unwrap();
        comm.ready_send(next, 9, &[me as u8]).unwrap();
        let first = h.wait().unwrap()[0];

        let h = comm.irecv(prev, 10, &mut buf);
        comm.synchronous_send(next, 10, &[me as u8 + 100]).unwrap();
        let second = h.wait().unwrap()[0];
        (first, second)
    });
    assert_eq!(got, vec![(2, 102), (0, 100), (1, 101)]);
}

#[test]
fn no_comm_is_a_group_of_one() {
    let comm = NoComm;
    assert_eq!((comm.rank(), comm.size()), (0, 1));
    let local = &LocalComm::group(1)[0];
    assert_eq!((local.rank(), local.size()), (0, 1));
}
