//! Node Status Updater
//!
//! Registration, heartbeat, and directive-dispatch control plane for a
//! worker node in a distributed compute cluster.

pub mod cache;
pub mod collector;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod heartbeat;
pub mod keepalive;
pub mod labels;
pub mod metrics;
pub mod model;
pub mod pending;
pub mod registrar;
pub mod rpc;
pub mod secret;
pub mod service;

pub use config::NsuConfig;
pub use error::{NsuError, Result};
pub use model::{ApplicationId, ContainerId, NodeId, Resource};
pub use service::NodeStatusUpdaterService;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn library_types_resolve() {
        let _ = std::any::type_name::<NsuConfig>();
        let _ = std::any::type_name::<NodeStatusUpdaterService>();
        let _ = std::any::type_name::<NsuError>();
    }
}
