pub mod binder;
pub mod profiler;
pub mod timeline;
