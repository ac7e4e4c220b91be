use crate::{
    ast::{
        Identifier, Literal, Node, Param, ParamValue, PartialKind, PartialTarget, PathSegment,
        Position, SectionKind,
    },
    error::{ParseError, ParseErrorKind},
};

/// A saved parser location, used to backtrack out of a failed alternative.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct Mark {
    pos: usize,
    /// Current line number (1-indexed)
    line: usize,
    /// Current column, in characters (1-indexed)
    column: usize,
    /// Whether the last character consumed was a `\r`, so that a following
    /// `\n` does not count as a second line break.
    seen_cr: bool,
}

impl Mark {
    const START: Self = Self {
        pos: 0,
        line: 1,
        column: 1,
        seen_cr: false,
    };
}

/// The quoted string form of the template language (`"..."`), which is either
/// plain text or a small body with references in it.
enum Inline {
    Text(String),
    Body(Node),
}

struct Parser<'a> {
    input: &'a str,
    at: Mark,
    /// Depth of named rules and lookaheads currently being tried. Failures
    /// inside them are reported under the rule's name, not their terminals.
    silenced: usize,
    rightmost: Mark,
    expected: Vec<String>,
    /// A semantic failure (bad end tag) that aborts the whole parse.
    fatal: Option<ParseError>,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            at: Mark::START,
            silenced: 0,
            rightmost: Mark::START,
            expected: Vec::new(),
            fatal: None,
        }
    }

    #[inline]
    const fn mark(&self) -> Mark {
        self.at
    }

    #[inline]
    const fn reset(&mut self, mark: Mark) {
        self.at = mark;
    }

    #[inline]
    const fn position(&self) -> Position {
        Position::new(self.at.line, self.at.column)
    }

    fn rest(&self) -> &'a str {
        self.input.get(self.at.pos..).unwrap_or_default()
    }

    const fn eof(&self) -> bool {
        self.at.pos >= self.input.len()
    }

    fn peek_char(&self) -> Option<char> {
        self.rest().chars().next()
    }

    /// Consumes one character, keeping line and column in sync. `\r\n` counts
    /// as a single line break.
    fn advance(&mut self, c: char) {
        self.at.pos = self.at.pos.saturating_add(c.len_utf8());
        match c {
            '\n' => {
                if !self.at.seen_cr {
                    self.at.line = self.at.line.saturating_add(1);
                }
                self.at.column = 1;
                self.at.seen_cr = false;
            }
            '\r' | '\u{2028}' | '\u{2029}' => {
                self.at.line = self.at.line.saturating_add(1);
                self.at.column = 1;
                self.at.seen_cr = true;
            }
            _ => {
                self.at.column = self.at.column.saturating_add(1);
                self.at.seen_cr = false;
            }
        }
    }

    fn make_error(&self, at: Mark, kind: ParseErrorKind) -> ParseError {
        ParseError {
            offset: at.pos,
            line: at.line,
            column: at.column,
            kind,
        }
    }

    /// Records that `what` was expected at the current position.
    fn fail(&mut self, what: &str) {
        if self.silenced > 0 || self.at.pos < self.rightmost.pos {
            return;
        }
        if self.at.pos > self.rightmost.pos {
            self.rightmost = self.at;
            self.expected.clear();
        }
        self.expected.push(what.to_string());
    }

    /// Runs a named rule: restores the position if it fails and reports the
    /// failure under `name`.
    fn named<T, R: FnOnce(&mut Self) -> Option<T>>(&mut self, name: &str, rule: R) -> Option<T> {
        let start = self.mark();
        self.silenced = self.silenced.saturating_add(1);
        let result = rule(self);
        self.silenced = self.silenced.saturating_sub(1);
        if result.is_none() {
            self.reset(start);
            self.fail(name);
        }
        result
    }

    /// Runs an anonymous sequence, restoring the position if any step fails.
    fn attempt<T, R: FnOnce(&mut Self) -> Option<T>>(&mut self, rule: R) -> Option<T> {
        let start = self.mark();
        let result = rule(self);
        if result.is_none() {
            self.reset(start);
        }
        result
    }

    /// Negative lookahead: true when `rule` would not match here. Never
    /// consumes input.
    fn not<T, R: FnOnce(&mut Self) -> Option<T>>(&mut self, rule: R) -> bool {
        let start = self.mark();
        self.silenced = self.silenced.saturating_add(1);
        let result = rule(self);
        self.silenced = self.silenced.saturating_sub(1);
        self.reset(start);
        result.is_none()
    }

    /// Consumes `s` if the remaining input starts with it.
    fn literal(&mut self, s: &str) -> bool {
        if self.rest().starts_with(s) {
            for c in s.chars() {
                self.advance(c);
            }
            true
        } else {
            self.fail(&format!("{s:?}"));
            false
        }
    }

    /// Consumes a single character matching `class`.
    fn char_class<C: Fn(char) -> bool>(&mut self, class: C, description: &str) -> Option<char> {
        match self.peek_char() {
            Some(c) if class(c) => {
                self.advance(c);
                Some(c)
            }
            _ => {
                self.fail(description);
                None
            }
        }
    }

    fn any_char(&mut self) -> Option<char> {
        self.char_class(|_| true, "any character")
    }

    fn body(&mut self) -> Node {
        let position = self.position();
        let mut parts = Vec::new();
        while let Some(part) = self.part() {
            parts.push(part);
        }
        Node::Body { parts, position }
    }

    fn part(&mut self) -> Option<Node> {
        if self.fatal.is_some() {
            return None;
        }
        if let Some(node) = self.raw().or_else(|| self.comment()) {
            return Some(node);
        }
        let section = self.section();
        if section.is_some() || self.fatal.is_some() {
            return section;
        }
        self.partial()
            .or_else(|| self.special())
            .or_else(|| self.reference())
            .or_else(|| self.buffer())
    }

    fn section(&mut self) -> Option<Node> {
        self.named("section", |p| {
            let position = p.position();
            let start = p.mark();

            if let Some((kind, identifier, context, params)) = p.sec_tag_start() {
                p.skip_ws();
                if p.literal("}") {
                    let block = p.body();
                    if p.fatal.is_some() {
                        return None;
                    }
                    let mut bodies = p.bodies();
                    if p.fatal.is_some() {
                        return None;
                    }
                    let opened = identifier.text();
                    let closed = p.end_tag().map(|end| end.text());
                    if closed.as_deref() != Some(opened.as_str()) {
                        let error = p.make_error(
                            p.mark(),
                            ParseErrorKind::MissingEndTag {
                                opened,
                                found: closed,
                            },
                        );
                        p.fatal = Some(error);
                        return None;
                    }
                    bodies.push(("block".to_string(), block));
                    return Some(Node::Section {
                        kind,
                        identifier,
                        context,
                        params,
                        bodies,
                        position,
                    });
                }
            }

            p.reset(start);
            let (kind, identifier, context, params) = p.sec_tag_start()?;
            p.skip_ws();
            if !(p.literal("/") && p.literal("}")) {
                return None;
            }
            Some(Node::Section {
                kind,
                identifier,
                context,
                params,
                bodies: Vec::new(),
                position,
            })
        })
    }

    fn sec_tag_start(
        &mut self,
    ) -> Option<(SectionKind, Identifier, Option<Identifier>, Vec<Param>)> {
        self.attempt(|p| {
            if !p.literal("{") {
                return None;
            }
            let sigil = p.char_class(|c| SectionKind::from_sigil(c).is_some(), "[#?^<+@%]")?;
            let kind = SectionKind::from_sigil(sigil)?;
            p.skip_ws();
            let identifier = p.identifier()?;
            let context = p.context();
            let params = p.params();
            Some((kind, identifier, context, params))
        })
    }

    fn end_tag(&mut self) -> Option<Identifier> {
        self.named("end tag", |p| {
            if !(p.literal("{") && p.literal("/")) {
                return None;
            }
            p.skip_ws();
            let identifier = p.identifier()?;
            p.skip_ws();
            p.literal("}").then_some(identifier)
        })
    }

    fn context(&mut self) -> Option<Identifier> {
        self.attempt(|p| {
            if !p.literal(":") {
                return None;
            }
            p.identifier()
        })
    }

    fn params(&mut self) -> Vec<Param> {
        self.named("params", |p| {
            let mut params = Vec::new();
            while let Some(param) = p.param() {
                params.push(param);
            }
            Some(params)
        })
        .unwrap_or_default()
    }

    fn param(&mut self) -> Option<Param> {
        self.attempt(|p| {
            if p.ws().is_none() {
                return None;
            }
            p.skip_ws();
            let key = p.key()?;
            if !p.literal("=") {
                return None;
            }
            let value = if let Some(number) = p.number() {
                ParamValue::Literal(number)
            } else if let Some(identifier) = p.identifier() {
                ParamValue::Identifier(identifier)
            } else {
                match p.inline()? {
                    Inline::Text(text) => ParamValue::Literal(Literal::String(text)),
                    Inline::Body(body) => ParamValue::Inline(Box::new(body)),
                }
            };
            Some(Param { key, value })
        })
    }

    fn bodies(&mut self) -> Vec<(String, Node)> {
        self.named("bodies", |p| {
            let mut bodies = Vec::new();
            loop {
                let next = p.attempt(|p| {
                    if !(p.literal("{") && p.literal(":")) {
                        return None;
                    }
                    let key = p.key()?;
                    p.literal("}").then_some(key)
                });
                let Some(key) = next else { break };
                let body = p.body();
                if p.fatal.is_some() {
                    break;
                }
                bodies.push((key, body));
            }
            Some(bodies)
        })
        .unwrap_or_default()
    }

    fn reference(&mut self) -> Option<Node> {
        self.named("reference", |p| {
            let position = p.position();
            if !p.literal("{") {
                return None;
            }
            let identifier = p.identifier()?;
            let filters = p.filters();
            p.literal("}").then_some(Node::Reference {
                identifier,
                filters,
                position,
            })
        })
    }

    fn partial(&mut self) -> Option<Node> {
        self.named("partial", |p| {
            let position = p.position();
            if !p.literal("{") {
                return None;
            }
            let kind = match p.char_class(|c| c == '>' || c == '+', "[>+]")? {
                '>' => PartialKind::Include,
                _ => PartialKind::Block,
            };
            p.skip_ws();
            let target = if let Some(key) = p.key() {
                PartialTarget::Name(key)
            } else {
                match p.inline()? {
                    Inline::Text(text) => PartialTarget::Name(text),
                    Inline::Body(body) => PartialTarget::Inline(Box::new(body)),
                }
            };
            let context = p.context();
            let params = p.params();
            p.skip_ws();
            if !(p.literal("/") && p.literal("}")) {
                return None;
            }
            Some(Node::Partial {
                kind,
                target,
                context,
                params,
                position,
            })
        })
    }

    fn filters(&mut self) -> Vec<String> {
        self.named("filters", |p| {
            let mut filters = Vec::new();
            while let Some(filter) = p.attempt(|p| if p.literal("|") { p.key() } else { None }) {
                filters.push(filter);
            }
            Some(filters)
        })
        .unwrap_or_default()
    }

    fn special(&mut self) -> Option<Node> {
        self.named("special", |p| {
            let position = p.position();
            if !(p.literal("{") && p.literal("~")) {
                return None;
            }
            let key = p.key()?;
            p.literal("}").then_some(Node::Special { key, position })
        })
    }

    fn identifier(&mut self) -> Option<Identifier> {
        self.named("identifier", |p| p.path().or_else(|| p.key().map(Identifier::Key)))
    }

    fn number(&mut self) -> Option<Literal> {
        self.named("number", |p| p.float().or_else(|| p.integer()))
    }

    fn digits(&mut self) -> Option<&'a str> {
        let start = self.at.pos;
        while self.char_class(|c| c.is_ascii_digit(), "[0-9]").is_some() {}
        let digits = self.input.get(start..self.at.pos)?;
        (!digits.is_empty()).then_some(digits)
    }

    fn float(&mut self) -> Option<Literal> {
        self.named("float", |p| {
            let start = p.at.pos;
            p.digits()?;
            if !p.literal(".") {
                return None;
            }
            p.digits()?;
            let text = p.input.get(start..p.at.pos)?;
            text.parse().ok().map(Literal::Float)
        })
    }

    fn integer(&mut self) -> Option<Literal> {
        self.named("integer", |p| {
            p.digits()?.parse().ok().map(Literal::Integer)
        })
    }

    fn path(&mut self) -> Option<Identifier> {
        self.named("path", |p| {
            let absolute = p.attempt(|p| {
                let key = p.key();
                let mut segments = Vec::new();
                while let Some(more) = p.array_part().or_else(|| p.array()) {
                    segments.extend(more);
                }
                if segments.is_empty() {
                    return None;
                }
                Some(match key {
                    Some(key) => {
                        segments.insert(0, PathSegment::Key(key));
                        Identifier::Path {
                            current: false,
                            segments,
                        }
                    }
                    None => Identifier::Path {
                        current: true,
                        segments,
                    },
                })
            });
            if absolute.is_some() {
                return absolute;
            }

            if !p.literal(".") {
                return None;
            }
            let mut segments = Vec::new();
            while let Some(more) = p.array_part().or_else(|| p.array()) {
                segments.extend(more);
            }
            Some(Identifier::Path {
                current: true,
                segments,
            })
        })
    }

    fn array(&mut self) -> Option<Vec<PathSegment>> {
        self.named("array", |p| {
            if !p.literal("[") {
                return None;
            }
            let index = match p.digits() {
                Some(digits) => PathSegment::Index(digits.to_string()),
                None => PathSegment::Lookup(Box::new(p.identifier()?)),
            };
            if !p.literal("]") {
                return None;
            }
            let mut segments = vec![index];
            if let Some(more) = p.array_part() {
                segments.extend(more);
            }
            Some(segments)
        })
    }

    fn array_part(&mut self) -> Option<Vec<PathSegment>> {
        self.named("array_part", |p| {
            let mut segments = Vec::new();
            while let Some(key) = p.attempt(|p| if p.literal(".") { p.key() } else { None }) {
                segments.push(PathSegment::Key(key));
            }
            if segments.is_empty() {
                return None;
            }
            if let Some(more) = p.array() {
                segments.extend(more);
            }
            Some(segments)
        })
    }

    fn key(&mut self) -> Option<String> {
        self.named("key", |p| {
            let start = p.at.pos;
            p.char_class(|c| c.is_ascii_alphabetic() || c == '_' || c == '$', "[a-zA-Z_$]")?;
            while p
                .char_class(
                    |c| c.is_ascii_alphanumeric() || matches!(c, '_' | '$' | '-'),
                    "[0-9a-zA-Z_$-]",
                )
                .is_some()
            {}
            p.input.get(start..p.at.pos).map(str::to_string)
        })
    }

    fn inline(&mut self) -> Option<Inline> {
        self.named("inline", |p| {
            if p
                .attempt(|p| (p.literal("\"") && p.literal("\"")).then_some(()))
                .is_some()
            {
                return Some(Inline::Text(String::new()));
            }

            let plain = p.attempt(|p| {
                if !p.literal("\"") {
                    return None;
                }
                let text = p.string_literal()?;
                p.literal("\"").then_some(text)
            });
            if let Some(text) = plain {
                return Some(Inline::Text(text));
            }

            let position = p.position();
            if !p.literal("\"") {
                return None;
            }
            let mut parts = Vec::new();
            while let Some(part) = p.inline_part() {
                parts.push(part);
            }
            if parts.is_empty() || !p.literal("\"") {
                return None;
            }
            Some(Inline::Body(Node::Body { parts, position }))
        })
    }

    fn inline_part(&mut self) -> Option<Node> {
        if let Some(node) = self.special().or_else(|| self.reference()) {
            return Some(node);
        }
        let position = self.position();
        self.string_literal()
            .map(|text| Node::Buffer { text, position })
    }

    /// Text inside a quoted string, up to the closing quote or the next tag.
    fn string_literal(&mut self) -> Option<String> {
        self.named("literal", |p| {
            let mut text = String::new();
            loop {
                if !p.not(|p| p.tag()) || !p.not(|p| p.eol()) {
                    break;
                }
                if p.rest().starts_with("\\\"") {
                    p.advance('\\');
                    p.advance('"');
                    text.push('"');
                    continue;
                }
                match p.char_class(|c| c != '"', "[^\"]") {
                    Some(c) => text.push(c),
                    None => break,
                }
            }
            (!text.is_empty()).then_some(text)
        })
    }

    fn buffer(&mut self) -> Option<Node> {
        self.named("buffer", |p| {
            let position = p.position();
            if let Some(eol) = p.eol() {
                let mut whitespace = String::new();
                while let Some(c) = p.ws() {
                    whitespace.push_str(&c);
                }
                return Some(Node::Format {
                    eol,
                    whitespace,
                    position,
                });
            }

            let mut text = String::new();
            while p.not(|p| p.tag())
                && p.not(|p| p.raw())
                && p.not(|p| p.comment())
                && p.not(|p| p.eol())
            {
                match p.any_char() {
                    Some(c) => text.push(c),
                    None => break,
                }
            }
            (!text.is_empty()).then_some(Node::Buffer { text, position })
        })
    }

    fn raw(&mut self) -> Option<Node> {
        self.named("raw", |p| {
            let position = p.position();
            p.delimited("{`", "`}")
                .map(|text| Node::Raw { text, position })
        })
    }

    fn comment(&mut self) -> Option<Node> {
        self.named("comment", |p| {
            let position = p.position();
            p.delimited("{!", "!}")
                .map(|text| Node::Comment { text, position })
        })
    }

    /// `open`, then everything up to the first `close`, then `close`.
    fn delimited(&mut self, open: &str, close: &str) -> Option<String> {
        if !self.literal(open) {
            return None;
        }
        let mut text = String::new();
        while !self.rest().starts_with(close) {
            text.push(self.any_char()?);
        }
        self.literal(close).then_some(text)
    }

    /// Anything that looks like a tag. Used as a lookahead so that text runs
    /// stop in front of tags, including malformed ones.
    fn tag(&mut self) -> Option<()> {
        let generic = self.attempt(|p| {
            if !p.literal("{") {
                return None;
            }
            p.skip_ws();
            p.char_class(|c| "#?^><+%:@/~".contains(c), "[#?^><+%:@/~%]")?;
            p.skip_ws();
            let mut consumed = 0_usize;
            while p.not(|p| p.literal("}").then_some(())) && p.not(|p| p.eol()) {
                p.any_char()?;
                consumed = consumed.saturating_add(1);
            }
            if consumed == 0 {
                return None;
            }
            p.skip_ws();
            p.literal("}").then_some(())
        });
        generic.or_else(|| self.reference().map(|_| ()))
    }

    fn eol(&mut self) -> Option<String> {
        for newline in ["\n", "\r\n", "\r", "\u{2028}", "\u{2029}"] {
            if self.rest().starts_with(newline) {
                self.literal(newline);
                return Some(newline.to_string());
            }
        }
        self.fail("end of line");
        None
    }

    fn ws(&mut self) -> Option<String> {
        if let Some(c) = self.char_class(
            |c| matches!(c, '\t' | '\u{0B}' | '\u{0C}' | ' ' | '\u{A0}' | '\u{FEFF}'),
            "whitespace",
        ) {
            return Some(c.to_string());
        }
        self.eol()
    }

    fn skip_ws(&mut self) {
        while self.ws().is_some() {}
    }

    /// The error for input the grammar could not consume, reported at the
    /// furthest position any rule reached.
    fn unexpected(&self) -> ParseError {
        let mut expected = self.expected.clone();
        expected.sort();
        expected.dedup();
        let found = self
            .input
            .get(self.rightmost.pos..)
            .and_then(|rest| rest.chars().next());
        self.make_error(self.rightmost, ParseErrorKind::Unexpected { expected, found })
    }
}

/// Parses template source into a [`Node::Body`].
pub fn parse(input: &str) -> Result<Node, ParseError> {
    let mut parser = Parser::new(input);
    let body = parser.body();

    if let Some(error) = parser.fatal.take() {
        return Err(error);
    }
    if !parser.eof() {
        return Err(parser.unexpected());
    }

    Ok(body)
}

/// Tests for individual functions in the parser module.
#[cfg(test)]
mod test_utils {
    use super::*;

    #[test]
    #[ntest::timeout(100)]
    fn test_crlf_counts_as_one_line() {
        let mut parser = Parser::new("a\r\nb\rc\nd");
        while let Some(c) = parser.peek_char() {
            parser.advance(c);
            if c == 'd' {
                break;
            }
        }
        assert_eq!(parser.at.line, 4);
        assert_eq!(parser.at.column, 2);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_tag_lookahead() {
        for tag in ["{#a}", "{ /a }", "{name}", "{~n}", "{>p/}", "{:else}"] {
            let mut parser = Parser::new(tag);
            assert!(!parser.not(|p| p.tag()), "{tag} should look like a tag");
            assert_eq!(parser.at.pos, 0);
        }
        for text in ["{ }", "{\"json\": 1}", "{#}", "{ a b }"] {
            let mut parser = Parser::new(text);
            assert!(parser.not(|p| p.tag()), "{text} should not look like a tag");
        }
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_failure_is_restored() {
        let mut parser = Parser::new("{#abc");
        assert!(parser.section().is_none());
        assert_eq!(parser.mark(), Mark::START);
    }
}
