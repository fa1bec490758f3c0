//! Deferred block scheduling.
//!
//! Recording ([`async_manager`]), execution and launch ([`fork_manager`],
//! [`spawner`], [`loopback`]), and the background machinery that keeps
//! sessions moving ([`sweeper`], [`discovery`]).

pub mod async_manager;
pub mod block_interface;
pub mod codec;
pub mod discovery;
pub mod fork_manager;
pub mod loopback;
pub mod registry;
pub mod spawner;
pub mod sweeper;
pub mod token;
pub mod wrapper;

use serde_json::Value;

use crate::persistence::config_repo::ConfigRepo;

use self::registry::{BlockRegistry, Invocation};

/// Registry name of the built-in echo closure.
pub const ECHO_HANDLER: &str = "blockdefer.echo";

/// Registry holding the handlers every process needs: the discovery probe
/// and an echo closure returning its arguments.
#[must_use]
pub fn builtin_registry(store: ConfigRepo) -> BlockRegistry {
    let mut registry = BlockRegistry::new();
    discovery::register_probe(&mut registry, store);
    registry.register_closure(ECHO_HANDLER, true, |call: Invocation| {
        call.activity("echo");
        Ok(Some(Value::Array(call.args)))
    });
    registry
}
