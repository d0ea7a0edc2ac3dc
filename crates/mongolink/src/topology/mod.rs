//! Server discovery and monitoring

pub mod description;
pub mod monitor;
pub mod selection;

pub use description::{
    ServerDescription, ServerRole, TopologyDescription, TopologyEvent, TopologyType,
};
pub use monitor::{ChangeHook, TopologyMonitor};
pub use selection::ServerSelector;
