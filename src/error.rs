use thiserror::Error;

pub type CurlyResult<T> = std::result::Result<T, CurlyError>;

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Error)]
pub enum ParseErrorKind {
    /// No alternative matched at the rightmost position the parser reached.
    #[error("Expected {}, found {}", describe_expected(.expected), describe_found(.found))]
    Unexpected {
        /// Sorted, de-duplicated descriptions of what would have been accepted.
        expected: Vec<String>,
        /// The offending character, or `None` at end of input.
        found: Option<char>,
    },
    /// A section was opened but its closing tag is absent or names another
    /// identifier.
    #[error("Expected end tag for {opened} but {}", describe_end_tag(.found))]
    MissingEndTag {
        opened: String,
        found: Option<String>,
    },
}

fn describe_expected(expected: &[String]) -> String {
    match expected {
        [] => "end of input".to_string(),
        [only] => only.clone(),
        [init @ .., last] => format!("{} or {}", init.join(", "), last),
    }
}

fn describe_found(found: &Option<char>) -> String {
    found.map_or_else(|| "end of input".to_string(), |c| format!("{c:?}"))
}

fn describe_end_tag(found: &Option<String>) -> String {
    found.as_ref().map_or_else(
        || "it was not found".to_string(),
        |name| format!("found {name}"),
    )
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Error)]
#[error("Parse error at line {line}, column {column}: {kind}")]
pub struct ParseError {
    /// Byte offset into the source.
    pub offset: usize,
    pub line: usize,
    pub column: usize,
    #[source]
    pub kind: ParseErrorKind,
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Error)]
pub enum CurlyError {
    #[error("Template not found: {template_name}")]
    MissingTemplate { template_name: String },
    #[error("Recursive partial inclusion detected (depth > {max_depth}): {template_name}")]
    RecursivePartial {
        template_name: String,
        max_depth: usize,
    },
    #[error("Recursive block override detected (depth > {max_depth}): {block}")]
    RecursiveBlock { block: String, max_depth: usize },
    #[error("Template [{template_name}] could not be loaded: {message}")]
    Loader {
        template_name: String,
        message: String,
    },
    #[error("Template [{template_name}] did not finish rendering synchronously")]
    Pending { template_name: String },
    #[error("Helper [{helper}] failed: {message}")]
    Helper { helper: String, message: String },
    #[error("Context function failed: {message}")]
    Function { message: String },
    #[error("I/O error: {message}")]
    Io { message: String },
    #[error(transparent)]
    Parse(#[from] ParseError),
}

impl CurlyError {
    pub fn helper<N: Into<String>, M: std::fmt::Display>(helper: N, message: M) -> Self {
        Self::Helper {
            helper: helper.into(),
            message: message.to_string(),
        }
    }

    pub fn function<M: std::fmt::Display>(message: M) -> Self {
        Self::Function {
            message: message.to_string(),
        }
    }
}

impl From<std::io::Error> for CurlyError {
    fn from(error: std::io::Error) -> Self {
        Self::Io {
            message: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ntest::timeout(100)]
    fn test_unexpected_message_lists_alternatives() {
        let err = ParseError {
            offset: 4,
            line: 1,
            column: 5,
            kind: ParseErrorKind::Unexpected {
                expected: vec!["\"}\"".to_string(), "filters".to_string(), "key".to_string()],
                found: Some('#'),
            },
        };
        assert_eq!(
            err.to_string(),
            "Parse error at line 1, column 5: Expected \"}\", filters or key, found '#'"
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_missing_end_tag_message() {
        let kind = ParseErrorKind::MissingEndTag {
            opened: "items".to_string(),
            found: None,
        };
        assert_eq!(
            kind.to_string(),
            "Expected end tag for items but it was not found"
        );

        let kind = ParseErrorKind::MissingEndTag {
            opened: "items".to_string(),
            found: Some("other".to_string()),
        };
        assert_eq!(kind.to_string(), "Expected end tag for items but found other");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_parse_error_converts_into_curly_error() {
        let err: CurlyError = ParseError {
            offset: 0,
            line: 1,
            column: 1,
            kind: ParseErrorKind::Unexpected {
                expected: vec![],
                found: Some('x'),
            },
        }
        .into();
        assert!(matches!(err, CurlyError::Parse(ParseError { line: 1, .. })));
        assert!(std::error::Error::source(&err).is_some());
    }
}
