use crate::{
    ast::{Node, Param, ParamValue, PartialTarget, Position},
    config::{EngineConfig, Whitespace},
};

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub(crate) struct OptimizerOptions {
    pub whitespace: Whitespace,
}

impl From<&EngineConfig> for OptimizerOptions {
    fn from(config: &EngineConfig) -> Self {
        Self {
            whitespace: config.whitespace,
        }
    }
}

/// Rewrites a freshly parsed tree into the form the compiler expects: no
/// comments, no specials, and no two adjacent text buffers.
pub(crate) fn optimize(node: Node, options: &OptimizerOptions) -> Node {
    let position = node.position();
    match node {
        Node::Body { parts, position } => compact(parts, position, options),
        other @ (Node::Buffer { .. }
        | Node::Format { .. }
        | Node::Raw { .. }
        | Node::Comment { .. }
        | Node::Special { .. }
        | Node::Reference { .. }
        | Node::Section { .. }
        | Node::Partial { .. }) => optimize_node(other, options).unwrap_or(Node::Body {
            parts: Vec::new(),
            position,
        }),
    }
}

/// `None` means the node is dropped from its parent body.
fn optimize_node(node: Node, options: &OptimizerOptions) -> Option<Node> {
    match node {
        Node::Body { parts, position } => Some(compact(parts, position, options)),
        Node::Comment { .. } => None,
        Node::Format {
            eol,
            whitespace,
            position,
        } => match options.whitespace {
            Whitespace::Strip => None,
            Whitespace::Preserve => Some(Node::Buffer {
                text: eol + &whitespace,
                position,
            }),
        },
        Node::Special { key, position } => Some(Node::Buffer {
            text: special_text(&key).to_string(),
            position,
        }),
        Node::Section {
            kind,
            identifier,
            context,
            params,
            bodies,
            position,
        } => Some(Node::Section {
            kind,
            identifier,
            context,
            params: optimize_params(params, options),
            bodies: bodies
                .into_iter()
                .map(|(name, body)| (name, optimize(body, options)))
                .collect(),
            position,
        }),
        Node::Partial {
            kind,
            target,
            context,
            params,
            position,
        } => Some(Node::Partial {
            kind,
            target: match target {
                PartialTarget::Inline(body) => {
                    PartialTarget::Inline(Box::new(optimize(*body, options)))
                }
                name @ PartialTarget::Name(_) => name,
            },
            context,
            params: optimize_params(params, options),
            position,
        }),
        leaf @ (Node::Buffer { .. } | Node::Raw { .. } | Node::Reference { .. }) => Some(leaf),
    }
}

fn optimize_params(params: Vec<Param>, options: &OptimizerOptions) -> Vec<Param> {
    params
        .into_iter()
        .map(|Param { key, value }| Param {
            key,
            value: match value {
                ParamValue::Inline(body) => ParamValue::Inline(Box::new(optimize(*body, options))),
                other @ (ParamValue::Literal(_) | ParamValue::Identifier(_)) => other,
            },
        })
        .collect()
}

/// Optimizes each part and merges runs of text into one buffer.
fn compact(parts: Vec<Node>, position: Position, options: &OptimizerOptions) -> Node {
    let mut out: Vec<Node> = Vec::with_capacity(parts.len());
    for part in parts {
        let Some(part) = optimize_node(part, options) else {
            continue;
        };
        if let Node::Buffer { text, .. } = &part {
            if let Some(Node::Buffer { text: last, .. }) = out.last_mut() {
                last.push_str(text);
                continue;
            }
        }
        out.push(part);
    }
    Node::Body {
        parts: out,
        position,
    }
}

pub(crate) fn special_text(key: &str) -> &'static str {
    match key {
        "s" => " ",
        "n" => "\n",
        "r" => "\r",
        "lb" => "{",
        "rb" => "}",
        _ => "",
    }
}
