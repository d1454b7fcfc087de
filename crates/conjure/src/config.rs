// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Spawn configuration passed to every `conjure` call.

/// Per-conjury settings: a diagnostic name and the size of its stack.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Config {
    /// Shown in logs and error messages. Not required to be unique.
    pub name: String,
    /// Usable stack bytes. A guard page is added on top of this.
    pub stack_size: usize,
}

impl Config {
    pub const DEFAULT_STACK_SIZE: usize = 16 * 1024;

    pub fn new() -> Self {
        Self {
            name: String::new(),
            stack_size: Self::DEFAULT_STACK_SIZE,
        }
    }

    /// Default-sized conjury with the given name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::new()
        }
    }

    pub fn stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_stack_is_16k() {
        let config = Config::default();
        assert_eq!(config.stack_size, 16384);
        assert!(config.name.is_empty());
    }

    #[test]
    fn builder_overrides() {
        let config = Config::named("producer").stack_size(64 * 1024);
        assert_eq!(config.name, "producer");
        assert_eq!(config.stack_size, 65536);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn deserialize_fills_defaults() {
        let config: Config = serde_json::from_str(r#"{"name":"io"}"#).unwrap();
        assert_eq!(config, Config::named("io"));
    }
}
