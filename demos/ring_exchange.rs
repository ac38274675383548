//! cargo mpirun -n 4 --features mpi-support --example ring_exchange
// Every rank sends a short row to its right neighbour, then the reverse plan
// sends the rows back.

#[cfg(feature = "mpi-support")]
fn main() {
    use sieve_distributor::prelude::*;
    use std::process;

    let comm = MpiComm::new().expect("MPI initialization failed");
    let rank = comm.rank();
    let size = comm.size();
    if size < 2 {
        eprintln!("This example requires at least 2 ranks.");
        process::exit(1);
    }

    // 1) Build the plan: three values per item, one item to the right
    let right = ((rank + 1) % size) as i32;
    let mut plan = Distributor::new(&comm);
    let senders = plan
        .create_from_sends(&[right])
        .expect("plan construction failed");
    println!("[rank {}] {} rank(s) send to me\n{}", rank, senders, plan);

    // 2) Forward exchange
    let row = [rank as f64, rank as f64 + 0.5, rank as f64 + 0.25];
    let mut got = vec![0.0f64; 3 * plan.total_receive_length()];
    plan.exchange(&row, 3, &mut got).expect("forward exchange failed");
    let left = (rank + size - 1) % size;
    assert_eq!(got[0], left as f64);

    // 3) Send it back through the cached reverse plan
    let mut back = vec![0.0f64; 3];
    plan.exchange_reverse(&got, 3, &mut back)
        .expect("reverse exchange failed");
    assert_eq!(back, row);

    if rank == 0 {
        println!("MPI ring exchange succeeded on {} ranks!", size);
    }
}

#[cfg(not(feature = "mpi-support"))]
fn main() {
    eprintln!("This example requires the 'mpi-support' feature to run.");
}
