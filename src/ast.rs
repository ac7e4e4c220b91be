/// Line and column (both 1-indexed) of the first character of a node.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct Position {
    pub line: usize,
    pub column: usize,
}

impl Position {
    pub const fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }
}

/// The sigil that opens a section tag.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SectionKind {
    /// `{#key}`: iterate arrays, render truthy values.
    Section,
    /// `{?key}`: render if the value is not empty.
    Exists,
    /// `{^key}`: render if the value is empty.
    NotExists,
    /// `{<name}`: define an overridable block.
    BlockDefinition,
    /// `{+name}`: yield to an override of `name`, else the default body.
    BlockReference,
    /// `{@name}`: invoke a registered helper.
    Helper,
    /// `{%name}`: compile-time pragma.
    Pragma,
}

impl SectionKind {
    pub(crate) const fn from_sigil(sigil: char) -> Option<Self> {
        match sigil {
            '#' => Some(Self::Section),
            '?' => Some(Self::Exists),
            '^' => Some(Self::NotExists),
            '<' => Some(Self::BlockDefinition),
            '+' => Some(Self::BlockReference),
            '@' => Some(Self::Helper),
            '%' => Some(Self::Pragma),
            _ => None,
        }
    }

    pub const fn sigil(self) -> char {
        match self {
            Self::Section => '#',
            Self::Exists => '?',
            Self::NotExists => '^',
            Self::BlockDefinition => '<',
            Self::BlockReference => '+',
            Self::Helper => '@',
            Self::Pragma => '%',
        }
    }
}

/// A single step of a dotted or bracketed path.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq)]
pub enum PathSegment {
    /// `.name`, or the leading key of an absolute path.
    Key(String),
    /// `[0]`: a literal numeric index.
    Index(String),
    /// `[other.key]`: an index resolved from the context at render time.
    Lookup(Box<Identifier>),
}

/// A variable reference: either a bare key or a path.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq)]
pub enum Identifier {
    Key(String),
    /// `current` is set for paths that start with `.`, which only search the
    /// innermost frame.
    Path {
        current: bool,
        segments: Vec<PathSegment>,
    },
}

impl Identifier {
    /// The source-level spelling used to match end tags and name helpers.
    pub fn text(&self) -> String {
        match self {
            Self::Key(key) => key.clone(),
            Self::Path { current, segments } => {
                let mut out = String::new();
                if *current {
                    out.push('.');
                }
                for (i, segment) in segments.iter().enumerate() {
                    match segment {
                        PathSegment::Key(key) => {
                            if i > 0 {
                                out.push('.');
                            }
                            out.push_str(key);
                        }
                        PathSegment::Index(index) => {
                            out.push('[');
                            out.push_str(index);
                            out.push(']');
                        }
                        PathSegment::Lookup(inner) => {
                            out.push('[');
                            out.push_str(&inner.text());
                            out.push(']');
                        }
                    }
                }
                out
            }
        }
    }
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    String(String),
    Integer(i64),
    Float(f64),
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Literal(Literal),
    Identifier(Identifier),
    /// An interpolated string such as `"{first} {last}"`, kept as a body.
    Inline(Box<Node>),
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub key: String,
    pub value: ParamValue,
}

/// What a `{>...}` or self-closing `{+...}` tag points at.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq)]
pub enum PartialTarget {
    /// A bare key or a plain quoted string.
    Name(String),
    /// A quoted string containing references, resolved at render time.
    Inline(Box<Node>),
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PartialKind {
    /// `{>name/}`
    Include,
    /// `{+name/}`
    Block,
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Body {
        parts: Vec<Node>,
        position: Position,
    },
    /// Literal text.
    Buffer {
        text: String,
        position: Position,
    },
    /// A line break and the indentation that follows it.
    Format {
        eol: String,
        whitespace: String,
        position: Position,
    },
    /// Text between the raw markers, kept verbatim.
    Raw {
        text: String,
        position: Position,
    },
    /// `{!...!}`
    Comment {
        text: String,
        position: Position,
    },
    /// `{~n}` and friends.
    Special {
        key: String,
        position: Position,
    },
    Reference {
        identifier: Identifier,
        filters: Vec<String>,
        position: Position,
    },
    Section {
        kind: SectionKind,
        identifier: Identifier,
        context: Option<Identifier>,
        params: Vec<Param>,
        /// Named bodies; the main body is stored under `block`.
        bodies: Vec<(String, Node)>,
        position: Position,
    },
    Partial {
        kind: PartialKind,
        target: PartialTarget,
        context: Option<Identifier>,
        params: Vec<Param>,
        position: Position,
    },
}

impl Node {
    pub const fn position(&self) -> Position {
        match self {
            Self::Body { position, .. }
            | Self::Buffer { position, .. }
            | Self::Format { position, .. }
            | Self::Raw { position, .. }
            | Self::Comment { position, .. }
            | Self::Special { position, .. }
            | Self::Reference { position, .. }
            | Self::Section { position, .. }
            | Self::Partial { position, .. } => *position,
        }
    }
}
