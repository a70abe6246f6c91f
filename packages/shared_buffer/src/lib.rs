#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Reference-counted byte buffers that many owners can share without copying, with mutation
//! gated on exclusive ownership, plus fixed-size pools that recycle buffers instead of freeing
//! them.
//!
//! This package provides [`BufferRef`], a handle to a shared buffer, and [`BufferPool`], a
//! recycling allocator for buffers of one size.
//!
//! # Features
//!
//! - **Zero-copy sharing**: Cloning a [`BufferRef`] bumps an atomic reference count. The
//!   contents are never copied.
//! - **Enforced exclusivity**: Mutable access is only granted through
//!   [`BufferRef::get_mut()`] while a single handle exists, or through
//!   [`BufferRef::make_writable()`], which copies first if needed.
//! - **Flexible ownership**: Buffers can be allocated by this crate, wrap a `Vec<u8>` or static
//!   data, or wrap arbitrary memory with a caller-supplied release function.
//! - **Copy-on-write resizing**: [`BufferRef::realloc()`] resizes in place when possible and
//!   copies otherwise, never affecting other handles.
//! - **Recycling pools**: Buffers from a [`BufferPool`] return to its free-list when released.
//!   The pool itself is torn down only once it is no longer used and every buffer it issued
//!   has come back.
//! - **Recoverable allocation failure**: Every allocation, including buffer metadata, goes
//!   through a [`RawAllocator`] and failure is reported as [`Error::OutOfMemory`].
//!
//! # Example
//!
//! ```rust
//! use shared_buffer::{BufferPool, BufferRef};
//!
//! let pool = BufferPool::new(1024);
//!
//! // Fill a pooled buffer while we are its only owner.
//! let mut buffer = pool.get().unwrap();
//! buffer.get_mut().unwrap()[..5].copy_from_slice(b"hello");
//!
//! // Share it with consumers without copying.
//! let consumer = buffer.clone();
//! assert_eq!(&consumer[..5], b"hello");
//! assert!(!buffer.is_writable());
//!
//! // When the last handle is gone, the memory goes back to the pool.
//! drop(buffer);
//! drop(consumer);
//! assert_eq!(pool.available(), 1);
//!
//! // Standalone buffers work the same way, minus the recycling.
//! let standalone = BufferRef::copy_from_slice(b"standalone").unwrap();
//! assert_eq!(standalone.ref_count(), 1);
//! ```
//!
//! # Logging
//!
//! Pool lifecycle events are emitted as [`tracing`] events at the `debug` level, individual
//! buffer reuse and reallocation decisions at the `trace` level. No subscriber is installed by
//! this crate.

mod allocator;
mod buffer_ref;
mod builder;
mod constants;
mod error;
mod flags;
mod header;
mod pool;
mod reuse_policy;

pub use allocator::{Global, RawAllocator, TrackingAllocator};
pub use buffer_ref::*;
pub use builder::*;
pub use error::*;
pub use flags::*;
pub use pool::BufferPool;
pub use reuse_policy::*;
