//! cargo mpirun -n 3 --features mpi-support --example gather_by_owner
// Each rank asks for a handful of global ids; the id's owner is `id % size`.
// The plan is built from the receive side and the owners answer with a value
// computed from the id.

#[cfg(feature = "mpi-support")]
fn main() {
    use sieve_distributor::prelude::*;

    let comm = MpiComm::new().expect("MPI initialization failed");
    let rank = comm.rank();
    let size = comm.size();

    // 1) Which ids do I need, and who owns them?
    let wanted: Vec<u64> = (0..6).map(|k| (5 * rank + 2 * k + 1) as u64).collect();
    let owners: Vec<i32> = wanted.iter().map(|&id| (id % size as u64) as i32).collect();

    // 2) Route the ids to their owners; the plan now moves owner data to me
    let mut plan = Distributor::new(&comm);
    let (requesters, ids) = plan
        .create_from_recvs(&owners, &wanted)
        .expect("plan construction failed");
    println!(
        "[rank {}] serving {} id(s) to ranks {:?}",
        rank,
        ids.len(),
        requesters
    );

    // 3) Owners answer; data arrives grouped by owner rank
    let answers: Vec<u64> = ids.iter().map(|id| id * id).collect();
    let mut got = vec![0u64; plan.total_receive_length()];
    plan.exchange(&answers, 1, &mut got).expect("exchange failed");

    let mut expected: Vec<(i32, u64)> = owners.iter().copied().zip(wanted.iter().map(|id| id * id)).collect();
    expected.sort_by_key(|&(owner, _)| owner);
    assert!(expected.iter().map(|&(_, v)| v).eq(got.iter().copied()));

    if rank == 0 {
        println!("MPI gather-by-owner example succeeded!");
    }
}

#[cfg(not(feature = "mpi-support"))]
fn main() {
    eprintln!("This example requires the 'mpi-support' feature to run.");
}
