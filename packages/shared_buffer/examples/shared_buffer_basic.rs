//! Demonstrates sharing, copy-on-write and resizing of standalone buffers.

use shared_buffer::{BufferRef, Reallocation};
use tracing_subscriber::EnvFilter;

fn main() -> shared_buffer::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("=== BufferRef Examples ===");
    println!();

    let mut buffer = BufferRef::alloc_zeroed(16)?;
    println!(
        "Allocated {} bytes, ref count {}",
        buffer.len(),
        buffer.ref_count()
    );

    if let Some(contents) = buffer.get_mut() {
        contents[..5].copy_from_slice(b"hello");
    }

    let reader = buffer.clone();
    println!(
        "After clone: ref count {}, writable: {}",
        buffer.ref_count(),
        buffer.is_writable()
    );

    // The reader keeps the old contents, the writer gets a private copy.
    let mut writer = buffer.clone();
    writer.make_writable()?[0] = b'j';
    println!(
        "Reader sees {:?}, writer sees {:?}",
        String::from_utf8_lossy(&reader[..5]),
        String::from_utf8_lossy(&writer[..5])
    );

    let mut slot = Some(writer);
    let outcome = BufferRef::realloc(&mut slot, 1024)?;
    assert_eq!(outcome, Reallocation::Copied);
    println!("Grew the writer to 1024 bytes: {outcome:?}");

    let outcome = BufferRef::realloc(&mut slot, 4096)?;
    println!("Grew it again to 4096 bytes: {outcome:?}");

    BufferRef::unref(&mut slot);
    drop(reader);
    println!(
        "Remaining ref count of the original: {}",
        buffer.ref_count()
    );

    Ok(())
}
