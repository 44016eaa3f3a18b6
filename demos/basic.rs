use segalloc::{Arena, Heap};

fn log_alloc(addr: *mut u8, size: usize) {
    println!("Requested {size} bytes of memory");
    println!("Received this address: {addr:?}");
}

fn main() {
    let mut heap = Heap::with_platform(Arena::new(1024 * 1024));

    let addr1 = heap.allocate(8);
    log_alloc(addr1, 8);

    let addr2 = heap.allocate(100);
    log_alloc(addr2, 100);

    let addr3 = heap.allocate(4000);
    log_alloc(addr3, 4000);

    unsafe {
        heap.deallocate(addr2);

        let addr4 = heap.resize(addr1, 64);
        println!("Resized {addr1:?} to 64 bytes: {addr4:?}");

        heap.deallocate(addr4);
        heap.deallocate(addr3);
    }

    match heap.verify() {
        Ok(stats) => println!("{stats:#?}"),
        Err(err) => println!("{err}"),
    }
}
