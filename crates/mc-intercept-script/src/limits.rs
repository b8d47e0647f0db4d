//! Sandbox limits for filter scripts.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptLimits {
    #[serde(default = "default_memory_mb")]
    pub memory_mb: usize,
    /// VM instructions a single filter run may execute before it is aborted.
    #[serde(default = "default_instruction_limit")]
    pub instruction_limit: u32,
}

impl Default for ScriptLimits {
    fn default() -> Self {
        Self {
            memory_mb: default_memory_mb(),
            instruction_limit: default_instruction_limit(),
        }
    }
}

fn default_memory_mb() -> usize {
    16
}

fn default_instruction_limit() -> u32 {
    1_000_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_absent() {
        let limits: ScriptLimits = toml::from_str("").unwrap();
        assert_eq!(limits.memory_mb, 16);
        assert_eq!(limits.instruction_limit, 1_000_000);
    }

    #[test]
    fn partial_override() {
        let limits: ScriptLimits = toml::from_str("instruction_limit = 5000").unwrap();
        assert_eq!(limits.memory_mb, 16);
        assert_eq!(limits.instruction_limit, 5000);
    }
}
