//! Producer/consumer demonstration.
//!
//! One producer pushes eight integers through a capacity-2 buffer while
//! one consumer drains them; the process exits with the scheduler's
//! verdict (0 on completion, 1 on deadlock).

use std::process;
use std::rc::Rc;
use weft::sync::BoundedBuffer;
use weft::{Scheduler, ThreadBuilder};

fn main() {
    let sched = Scheduler::new();
    let buffer = Rc::new(BoundedBuffer::new(2));

    let outgoing = buffer.clone();
    ThreadBuilder::new("producer").spawn(&sched, move |cx| {
        for item in 1..=8 {
            outgoing.add(cx, item);
            println!("produced {item}");
        }
    });

    let incoming = buffer.clone();
    ThreadBuilder::new("consumer").spawn(&sched, move |cx| {
        for _ in 0..8 {
            let item: i32 = incoming.take(cx);
            println!("consumed {item}");
        }
    });

    process::exit(sched.run().exit_code());
}
