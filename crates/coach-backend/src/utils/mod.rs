pub mod accumulator;
pub mod sse;
