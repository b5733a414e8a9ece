//! This module works around limitations of the Rust programming language, and provides missing
//! functionalities that we may expect the Rust programming language and its standard libraries
//! to provide.

pub mod atomic_box;

/// The address of a stack variable in the caller's frame. This is the closest portable
/// approximation of the current stack pointer, and is what we record as the top of a stack
/// when a thread parks itself.
#[inline(never)]
pub fn approximate_stack_pointer() -> usize {
    let marker = 0u8;
    std::hint::black_box(&marker) as *const u8 as usize
}
