//! Plugin catalog, instance lifecycle and the handle registry.
//!
//! Nothing in this crate speaks the wire protocol; the server crate maps
//! [`InstanceError`] variants onto protocol error codes and [`HostEvent`]s
//! onto event lines.

pub mod catalog;
pub mod factory;
pub mod instance;
pub mod registry;

pub use catalog::{Catalog, InProcessProber, Prober, SubprocessProber};
pub use factory::{BuiltinFactory, HostFactory, IsolationMode};
pub use instance::{
    HostEvent, InstanceError, InstanceInfo, InstanceState, ParameterState, PluginFactory,
    PluginInstance,
};
pub use registry::{InstanceSlot, Registry};
