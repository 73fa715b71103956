//! Capabilities that run in-process.

mod calculator;
mod clock;

pub use calculator::Calculator;
pub use clock::Clock;

use tracing::{debug, warn};

use crate::capability::{Factory, Origin, factory};
use crate::registry::Registry;

/// Every builtin as `(name, description)`.
pub fn catalog() -> Vec<(&'static str, &'static str)> {
    vec![
        (calculator::NAME, calculator::DESCRIPTION),
        (clock::NAME, clock::DESCRIPTION),
    ]
}

pub fn names() -> impl Iterator<Item = &'static str> {
    catalog().into_iter().map(|(name, _)| name)
}

pub fn factory_for(name: &str) -> Option<Factory> {
    match name {
        calculator::NAME => Some(factory(|| Ok(Calculator::new()))),
        clock::NAME => Some(factory(|| Ok(Clock::new()))),
        _ => None,
    }
}

/// Register the named builtins. Returns how many were added.
pub fn register_builtins(registry: &Registry, names: &[String]) -> usize {
    let mut registered = 0;
    for name in names {
        let Some(factory) = factory_for(name) else {
            warn!(builtin = %name, "unknown builtin capability");
            continue;
        };
        match registry.register(name.clone(), Origin::Builtin, factory) {
            Ok(true) => registered += 1,
            Ok(false) => {}
            Err(e) => warn!(builtin = %name, error = %e, "failed to register builtin"),
        }
    }
    debug!(registered, "registered builtin capabilities");
    registered
}

pub fn register_all(registry: &Registry) -> usize {
    let names: Vec<String> = names().map(str::to_string).collect();
    register_builtins(registry, &names)
}
