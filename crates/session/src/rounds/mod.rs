//! Built-in round implementations.

mod null;

pub use null::NullRound;
