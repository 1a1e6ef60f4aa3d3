//! Cross-component scenario tests.
//!
//! Every scenario runs the real resolver, producer and engine against an
//! in-memory fleet.

mod lifecycle;
