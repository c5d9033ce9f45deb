//! Trace context carried through a request tree and the profiler labels
//! bound for it on the execution units doing the work

pub mod carrier;
pub mod context;
pub mod fanout;
pub mod labels;
pub mod propagation;
pub mod sequence;
pub mod span;
