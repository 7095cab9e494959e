//! # agent-utilities
//!
//! Built-in utilities for the agent run loop.
//!
//! | id             | does                                               |
//! |----------------|----------------------------------------------------|
//! | `calc`         | arithmetic with `+ - * / ^` and parentheses        |
//! | `datetime`     | current UTC time as iso, human or unix             |
//! | `service_call` | internal HTTP call carrying the caller's identity  |

pub mod error;
pub mod svckit;

use std::sync::Arc;

use agent_core::UtilityRegistry;

pub use error::{Result, UtilityError};
pub use svckit::{
    CalcUtility, DateTimeUtility, ServiceCallConfig, ServiceCallUtility, evaluate, format_number,
};

/// Register the built-in utilities.
///
/// `service_call` is only registered when a service configuration is given.
pub fn register_defaults(
    registry: &mut UtilityRegistry,
    service: Option<ServiceCallConfig>,
) -> agent_core::Result<()> {
    registry.register(CalcUtility)?;
    registry.register(DateTimeUtility)?;
    if let Some(config) = service {
        registry.register_arc(Arc::new(ServiceCallUtility::new(config)?))?;
    }
    tracing::info!(utilities = ?registry.names(), "Registered built-in utilities");
    Ok(())
}
