//! Architecture support. x86-64 only; the platform boundary lives here and
//! everything above it is portable Rust.

pub mod x86_64;
