//! In-process coordination between concurrent requests.

pub mod locks;

pub use locks::KeyedLocks;
