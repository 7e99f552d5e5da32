use std::collections::HashMap;

use parallel_core::env::PARALLEL_ROLE_VAR;
use parallel_core::{ParallelError, WorkerId};

/// Which half of the dual-role binary this process is playing.
///
/// Classified once, at the very start of [`crate::start_app`], from a
/// reserved environment variable — immutable for the rest of the
/// process's life.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Master,
    Worker(WorkerId),
}

impl Role {
    /// Classifies the current process from the real environment.
    pub fn detect() -> Result<Self, ParallelError> {
        let pairs: HashMap<String, String> = std::env::vars().collect();
        Self::detect_from(&pairs)
    }

    /// Classifies a process from an explicit environment map, so tests can
    /// exercise both branches without touching the real process environment.
    pub fn detect_from(pairs: &HashMap<String, String>) -> Result<Self, ParallelError> {
        match pairs.get(PARALLEL_ROLE_VAR) {
            None => Ok(Role::Master),
            Some(id) if id.trim().is_empty() => {
                Err(ParallelError::EnvInvalid(format!(
                    "{PARALLEL_ROLE_VAR} is set but empty"
                )))
            }
            Some(id) => Ok(Role::Worker(WorkerId(id.clone()))),
        }
    }

    pub fn is_master(&self) -> bool {
        matches!(self, Role::Master)
    }
}
