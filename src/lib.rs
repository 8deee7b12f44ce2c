// Grifola: demanded computation graphs for Rust.
//
// The engine maintains a DCG of mutable cells, memoized suspensions and
// the force/create edges between them.  On input mutation it marks the
// affected reverse edges dirty; on the next observation it repairs the
// graph with a truncated in-order walk that re-runs only the suspensions
// whose observed dependencies actually changed.  Memoization is keyed by
// argument value, by generative identity, or by first-class name.

#[macro_use]
pub mod macros;
pub mod name;
pub mod weakset;
pub mod engine;
pub mod memo;
pub mod collections;
pub mod geom;
