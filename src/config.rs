/// What happens to line breaks and the indentation that follows them.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum Whitespace {
    /// Drop them, so templates can be indented freely.
    #[default]
    Strip,
    /// Keep them as literal text.
    Preserve,
}

/// Engine-wide settings. Every field has a sensible default; the `with_*`
/// methods allow overriding them one at a time.
///
/// ```
/// use curly::{EngineConfig, Whitespace};
///
/// let config = EngineConfig::default()
///     .with_whitespace(Whitespace::Preserve)
///     .with_max_partial_depth(8);
/// assert_eq!(config.auto_escape.as_deref(), Some("h"));
/// ```
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EngineConfig {
    /// Filter applied after a reference's own filters unless it ends in `|s`.
    /// `None` turns auto-escaping off.
    pub auto_escape: Option<String>,
    pub whitespace: Whitespace,
    /// How deep partials, and block overrides resolving other overrides, may
    /// nest before a render is aborted.
    pub max_partial_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            auto_escape: Some("h".to_string()),
            whitespace: Whitespace::default(),
            max_partial_depth: 64,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn with_auto_escape<S: Into<String>>(mut self, filter: S) -> Self {
        self.auto_escape = Some(filter.into());
        self
    }

    #[must_use]
    pub fn without_auto_escape(mut self) -> Self {
        self.auto_escape = None;
        self
    }

    #[must_use]
    pub const fn with_whitespace(mut self, whitespace: Whitespace) -> Self {
        self.whitespace = whitespace;
        self
    }

    #[must_use]
    pub const fn with_max_partial_depth(mut self, depth: usize) -> Self {
        self.max_partial_depth = depth;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ntest::timeout(100)]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.auto_escape.as_deref(), Some("h"));
        assert_eq!(config.whitespace, Whitespace::Strip);
        assert_eq!(config.max_partial_depth, 64);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_builder_overrides() {
        let config = EngineConfig::default()
            .without_auto_escape()
            .with_whitespace(Whitespace::Preserve)
            .with_max_partial_depth(3);
        assert_eq!(config.auto_escape, None);
        assert_eq!(config.whitespace, Whitespace::Preserve);
        assert_eq!(config.max_partial_depth, 3);

        let config = config.with_auto_escape("j");
        assert_eq!(config.auto_escape.as_deref(), Some("j"));
    }
}
