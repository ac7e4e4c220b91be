use std::collections::BTreeMap;

use crate::{
    ast::{Identifier, Literal, Node, Param, ParamValue, PartialKind, PartialTarget, SectionKind},
    optimizer::special_text,
};

/// Index into [`Program::bodies`].
pub type BodyId = usize;

/// A compiled template: a table of bodies, each a flat list of operations,
/// plus the blocks the template defines. Compiling the same source twice
/// yields equal programs.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Program {
    pub name: Option<String>,
    pub root: BodyId,
    pub bodies: Vec<Vec<Op>>,
    /// `{<name}` definitions, by name.
    pub blocks: BTreeMap<String, BodyId>,
}

impl Program {
    /// The operations of body `id`; unknown ids are empty.
    pub fn body(&self, id: BodyId) -> &[Op] {
        self.bodies.get(id).map_or(&[], Vec::as_slice)
    }
}

/// A single rendering step.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Write(String),
    Reference {
        identifier: Identifier,
        filters: FilterChain,
    },
    Section {
        kind: SectionOp,
        identifier: Identifier,
        context: Option<Identifier>,
        params: Vec<(String, ParamExpr)>,
        bodies: Vec<(String, BodyId)>,
    },
    /// `{+name}`: an override from the context's block chain, or the local
    /// `block` body.
    Block {
        name: Name,
        context: Option<Identifier>,
        params: Vec<(String, ParamExpr)>,
        bodies: Vec<(String, BodyId)>,
    },
    Helper {
        name: String,
        context: Option<Identifier>,
        params: Vec<(String, ParamExpr)>,
        bodies: Vec<(String, BodyId)>,
    },
    Partial {
        name: Name,
        context: Option<Identifier>,
        params: Vec<(String, ParamExpr)>,
    },
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SectionOp {
    Section,
    Exists,
    NotExists,
}

/// A template or block name, either known at compile time or rendered from a
/// body at render time.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Name {
    Literal(String),
    Body(BodyId),
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq)]
pub enum ParamExpr {
    Literal(Literal),
    Identifier(Identifier),
    Body(BodyId),
}

/// The filters of one reference: the explicit ones, then the auto-escape
/// filter that was active where the reference was compiled.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct FilterChain {
    pub filters: Vec<String>,
    pub auto: Option<String>,
}

/// Turns one optimized tree into a [`Program`].
pub(crate) struct Compiler {
    name: Option<String>,
    bodies: Vec<Vec<Op>>,
    blocks: BTreeMap<String, BodyId>,
    /// The auto-escape filter for references compiled from here on.
    auto: Option<String>,
}

impl Compiler {
    pub(crate) fn new(name: Option<String>, auto_escape: Option<String>) -> Self {
        Self {
            name,
            bodies: Vec::new(),
            blocks: BTreeMap::new(),
            auto: auto_escape,
        }
    }

    pub(crate) fn compile(mut self, ast: &Node) -> Program {
        let root = self.body(ast);
        Program {
            name: self.name,
            root,
            bodies: self.bodies,
            blocks: self.blocks,
        }
    }

    /// Reserves an id before compiling the contents, so ids follow the order
    /// in which bodies are opened.
    fn body(&mut self, node: &Node) -> BodyId {
        let id = self.bodies.len();
        self.bodies.push(Vec::new());
        let mut ops = Vec::new();
        self.parts(node, &mut ops);
        if let Some(slot) = self.bodies.get_mut(id) {
            *slot = ops;
        }
        id
    }

    fn parts(&mut self, node: &Node, ops: &mut Vec<Op>) {
        match node {
            Node::Body { parts, .. } => {
                for part in parts {
                    self.node(part, ops);
                }
            }
            Node::Buffer { .. }
            | Node::Format { .. }
            | Node::Raw { .. }
            | Node::Comment { .. }
            | Node::Special { .. }
            | Node::Reference { .. }
            | Node::Section { .. }
            | Node::Partial { .. } => self.node(node, ops),
        }
    }

    fn node(&mut self, node: &Node, ops: &mut Vec<Op>) {
        match node {
            Node::Body { .. } => self.parts(node, ops),
            Node::Buffer { text, .. } | Node::Raw { text, .. } => write(ops, text.clone()),
            Node::Format {
                eol, whitespace, ..
            } => write(ops, format!("{eol}{whitespace}")),
            Node::Special { key, .. } => write(ops, special_text(key).to_string()),
            Node::Comment { .. } => {}
            Node::Reference {
                identifier,
                filters,
                ..
            } => ops.push(Op::Reference {
                identifier: identifier.clone(),
                filters: FilterChain {
                    filters: filters.clone(),
                    auto: self.auto.clone(),
                },
            }),
            Node::Section {
                kind,
                identifier,
                context,
                params,
                bodies,
                ..
            } => self.section(*kind, identifier, context, params, bodies, ops),
            Node::Partial {
                kind,
                target,
                context,
                params,
                ..
            } => {
                let name = match target {
                    PartialTarget::Name(name) => Name::Literal(name.clone()),
                    PartialTarget::Inline(body) => Name::Body(self.body(body)),
                };
                let params = self.params(params);
                ops.push(match kind {
                    PartialKind::Include => Op::Partial {
                        name,
                        context: context.clone(),
                        params,
                    },
                    PartialKind::Block => Op::Block {
                        name,
                        context: context.clone(),
                        params,
                        bodies: Vec::new(),
                    },
                });
            }
        }
    }

    fn section(
        &mut self,
        kind: SectionKind,
        identifier: &Identifier,
        context: &Option<Identifier>,
        params: &[Param],
        bodies: &[(String, Node)],
        ops: &mut Vec<Op>,
    ) {
        let kind = match kind {
            SectionKind::Section => SectionOp::Section,
            SectionKind::Exists => SectionOp::Exists,
            SectionKind::NotExists => SectionOp::NotExists,
            SectionKind::BlockDefinition => {
                if let Some((_, block)) = bodies.iter().find(|(name, _)| name == "block") {
                    let id = self.body(block);
                    self.blocks.insert(identifier.text(), id);
                }
                return;
            }
            SectionKind::Pragma => {
                self.pragma(identifier, context, bodies, ops);
                return;
            }
            SectionKind::BlockReference => {
                let bodies = self.bodies_of(bodies);
                ops.push(Op::Block {
                    name: Name::Literal(identifier.text()),
                    context: context.clone(),
                    params: self.params(params),
                    bodies,
                });
                return;
            }
            SectionKind::Helper => {
                let bodies = self.bodies_of(bodies);
                ops.push(Op::Helper {
                    name: identifier.text(),
                    context: context.clone(),
                    params: self.params(params),
                    bodies,
                });
                return;
            }
        };

        let bodies = self.bodies_of(bodies);
        ops.push(Op::Section {
            kind,
            identifier: identifier.clone(),
            context: context.clone(),
            params: self.params(params),
            bodies,
        });
    }

    /// `{%esc:X}...{/esc}` compiles its body inline with `X` as the
    /// auto-escape filter (`s` disables it, no context means `h`).
    fn pragma(
        &mut self,
        identifier: &Identifier,
        context: &Option<Identifier>,
        bodies: &[(String, Node)],
        ops: &mut Vec<Op>,
    ) {
        let name = identifier.text();
        if name != "esc" {
            tracing::debug!(pragma = %name, "Ignoring unknown pragma");
            return;
        }
        let auto = match context.as_ref().map(Identifier::text) {
            None => Some("h".to_string()),
            Some(filter) if filter == "s" => None,
            Some(filter) => Some(filter),
        };
        let saved = std::mem::replace(&mut self.auto, auto);
        if let Some((_, block)) = bodies.iter().find(|(name, _)| name == "block") {
            self.parts(block, ops);
        }
        self.auto = saved;
    }

    fn bodies_of(&mut self, bodies: &[(String, Node)]) -> Vec<(String, BodyId)> {
        bodies
            .iter()
            .map(|(name, body)| (name.clone(), self.body(body)))
            .collect()
    }

    fn params(&mut self, params: &[Param]) -> Vec<(String, ParamExpr)> {
        params
            .iter()
            .map(|param| {
                let value = match &param.value {
                    ParamValue::Literal(literal) => ParamExpr::Literal(literal.clone()),
                    ParamValue::Identifier(identifier) => ParamExpr::Identifier(identifier.clone()),
                    ParamValue::Inline(body) => ParamExpr::Body(self.body(body)),
                };
                (param.key.clone(), value)
            })
            .collect()
    }
}

fn write(ops: &mut Vec<Op>, text: String) {
    if !text.is_empty() {
        ops.push(Op::Write(text));
    }
}
