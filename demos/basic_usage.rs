use std::ptr::NonNull;

use segheap::{Heap, HeapConfig, IntegrityLevel, ZeroDepth, ZeroOnFree};

fn print_alloc(address: NonNull<u8>, size: usize, heap: &Heap) {
    println!("Requested {size} bytes of memory");
    println!(
        "Received this address: {address:?}, usable bytes: {:?}",
        heap.usable_size(address)
    );
}

fn main() {
    // RUST_LOG=segheap=debug shows what the heap is doing.
    env_logger::init();

    let config = HeapConfig::new()
        .with_heap_size(4 * 1024 * 1024)
        .with_integrity(IntegrityLevel::Thorough)
        .with_tracking(true)
        .with_debug(true)
        .with_zero_on_free(ZeroOnFree::new(ZeroDepth::Shallow, 32));

    let mut heap = match Heap::with_config(config) {
        Ok(heap) => heap,
        Err(error) => {
            eprintln!("{error}");
            return;
        }
    };

    let Some(small) = heap.allocate(24) else {
        eprintln!("out of memory");
        return;
    };
    print_alloc(small, 24, &heap);

    let Some(address) = heap.allocate(1024) else {
        eprintln!("out of memory");
        return;
    };
    print_alloc(address, 1024, &heap);

    unsafe {
        address.as_ptr().write_bytes(0xAA, 1024);

        println!("\nLet's try some reallocs");
        let Some(address) = heap.reallocate(Some(address), 20_000) else {
            eprintln!("reallocation failed");
            return;
        };
        print_alloc(address, 20_000, &heap);

        let preserved = std::slice::from_raw_parts(address.as_ptr(), 1024)
            .iter()
            .all(|byte| *byte == 0xAA);
        println!("First 1024 bytes preserved: {preserved}");

        heap.print_status();
        println!("{}", heap.status());

        println!("\nDeallocating everything...");
        heap.free(Some(small));
        heap.free(Some(address));
    }

    match heap.verify_integrity(false) {
        Ok(report) => println!("Integrity: {report:?}"),
        Err(error) => eprintln!("{error}"),
    }

    println!("{:?}", heap.stats());
}
