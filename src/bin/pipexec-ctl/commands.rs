use std::os::fd::AsFd;

use log::info;
use pipexec::execution::{FALLBACK_CHUNK_SIZE, pipe_capacity, pipe_max_size, tuned_chunk_size};

pub fn check_pipe_sizing() {
    info!("Checking pipe sizing");
    println!("Checking pipe sizing...\n");

    match pipe_max_size() {
        Some(max) => println!("[✓] System pipe max size: {} bytes", max),
        None => println!("[✗] System pipe max size unavailable"),
    }

    let (read_end, write_end) = match nix::unistd::pipe() {
        Ok(ends) => ends,
        Err(e) => {
            println!("[✗] Could not create a pipe: {}", e);
            return;
        }
    };

    match pipe_capacity(&read_end) {
        Some(capacity) => println!("[✓] Fresh pipe capacity: {} bytes", capacity),
        None => println!("[✗] Pipe capacity not reported, using fallback"),
    }

    let chunk = tuned_chunk_size(
        &[read_end.as_fd(), write_end.as_fd()],
        true,
        FALLBACK_CHUNK_SIZE,
    );
    println!("[✓] Transfer chunk size after raising: {} bytes", chunk);

    println!("\nFallback chunk size: {} bytes", FALLBACK_CHUNK_SIZE);
}
