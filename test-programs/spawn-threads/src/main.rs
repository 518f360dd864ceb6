//! Test tracee: spawn two worker threads, then sleep.

use std::thread;
use std::time::Duration;

fn main() {
    let workers: Vec<_> = (0..2)
        .map(|_| thread::spawn(|| thread::sleep(Duration::from_secs(30))))
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
}
