//! Block storage abstractions consumed by the database engine.

pub mod disk;

pub use disk::{Disk, RamDisk};
