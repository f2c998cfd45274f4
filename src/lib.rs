pub mod cache;
pub mod cleaner;
pub mod cluster;
pub mod common;
pub mod config;
pub mod error;
pub mod flow;
pub mod flowdb;
pub mod latency;
pub mod lock;
pub mod mac;
pub mod manager;
pub mod orchestrate;
pub mod pool;
pub mod remote;
pub mod simulated;
pub mod task;
pub mod wait;

pub use error::{Error, Result};
pub use manager::{Registry, RequestContext, VtnManager};

#[cfg(test)]
pub(crate) mod tests {
    use lazy_static::lazy_static;

    lazy_static! {
        pub static ref TRACING: () = tracing_subscriber::fmt().with_test_writer().init();
    }
}
