use std::{cell::Cell, fmt, rc::Rc};

use crate::{
    compiler::{BodyId, Program},
    value::Value,
};

/// State shared by the branches of a `{@select}` (or `{@math}` with a body).
#[derive(Debug)]
pub struct SelectState {
    pub key: Value,
    resolved: Cell<bool>,
}

impl SelectState {
    pub const fn new(key: Value) -> Self {
        Self {
            key,
            resolved: Cell::new(false),
        }
    }

    /// True once one branch has matched.
    pub fn is_resolved(&self) -> bool {
        self.resolved.get()
    }

    pub fn resolve(&self) {
        self.resolved.set(true);
    }
}

#[derive(Debug)]
struct Frame {
    head: Value,
    tail: Option<Rc<Frame>>,
    /// `(index, length)` for frames pushed while iterating an array.
    iteration: Option<(usize, usize)>,
    select: Option<Rc<SelectState>>,
}

/// A block override visible to `{+name}` tags: body `id` of `program`.
#[derive(Debug, Clone)]
pub struct BlockRef {
    pub program: Rc<Program>,
    pub id: BodyId,
}

/// The data a template renders against: a persistent stack of frames plus
/// global data and the chain of block overrides contributed by the templates
/// currently being rendered.
///
/// Every operation that "changes" a context returns a new one; the frames of
/// the original are shared, never modified.
#[derive(Clone, Default)]
pub struct Context {
    stack: Option<Rc<Frame>>,
    global: Value,
    /// Programs whose `{<name}` blocks are in scope, outermost first.
    blocks: Rc<Vec<Rc<Program>>>,
    template_name: Option<Rc<str>>,
    partial_depth: usize,
    block_depth: usize,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("current", &self.current())
            .field("template_name", &self.template_name)
            .field("partial_depth", &self.partial_depth)
            .field("block_depth", &self.block_depth)
            .finish_non_exhaustive()
    }
}

impl Context {
    /// A context whose only frame is `data`.
    pub fn new<V: Into<Value>>(data: V) -> Self {
        Self::default().push(data)
    }

    /// An empty stack over `global`, which is searched after every frame.
    pub fn with_global<V: Into<Value>>(global: V) -> Self {
        Self {
            global: global.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_template_name(mut self, name: &str) -> Self {
        self.template_name = Some(Rc::from(name));
        self
    }

    pub fn template_name(&self) -> Option<&str> {
        self.template_name.as_deref()
    }

    pub const fn global(&self) -> &Value {
        &self.global
    }

    /// The innermost frame's value.
    pub fn current(&self) -> Option<&Value> {
        self.stack.as_ref().map(|frame| &frame.head)
    }

    fn push_frame(
        &self,
        head: Value,
        iteration: Option<(usize, usize)>,
        select: Option<Rc<SelectState>>,
    ) -> Self {
        Self {
            stack: Some(Rc::new(Frame {
                head,
                tail: self.stack.clone(),
                iteration,
                select,
            })),
            ..self.clone()
        }
    }

    #[must_use]
    pub fn push<V: Into<Value>>(&self, head: V) -> Self {
        self.push_frame(head.into(), None, None)
    }

    /// Pushes one element of an array being iterated.
    #[must_use]
    pub fn push_indexed<V: Into<Value>>(&self, head: V, index: usize, length: usize) -> Self {
        self.push_frame(head.into(), Some((index, length)), None)
    }

    /// Pushes a frame that carries select state. The frame's own value is
    /// null, so lookups fall through to the enclosing frames.
    #[must_use]
    pub fn push_select(&self, key: Value) -> Self {
        self.push_frame(Value::Null, None, Some(Rc::new(SelectState::new(key))))
    }

    /// Replaces the whole stack with a single frame holding `head`.
    #[must_use]
    pub fn rebase<V: Into<Value>>(&self, head: V) -> Self {
        Self {
            stack: None,
            ..self.clone()
        }
        .push(head)
    }

    /// Select state of the innermost frame, if it was pushed by a select.
    pub fn select(&self) -> Option<Rc<SelectState>> {
        self.stack.as_ref().and_then(|frame| frame.select.clone())
    }

    fn iteration(&self) -> Option<(usize, usize)> {
        let mut frame = self.stack.as_deref();
        while let Some(f) = frame {
            if f.iteration.is_some() {
                return f.iteration;
            }
            frame = f.tail.as_deref();
        }
        None
    }

    /// Position within the nearest array being iterated.
    pub fn index(&self) -> Option<usize> {
        self.iteration().map(|(index, _)| index)
    }

    /// Length of the nearest array being iterated.
    pub fn length(&self) -> Option<usize> {
        self.iteration().map(|(_, length)| length)
    }

    /// Looks up a dotted path such as `a.b` or `.name`. A leading dot limits
    /// the search to the innermost frame.
    pub fn get(&self, path: &str) -> Option<Value> {
        let (current, path) = match path.strip_prefix('.') {
            Some(rest) => (true, rest),
            None => (false, path),
        };
        let keys: Vec<&str> = if path.is_empty() {
            Vec::new()
        } else {
            path.split('.').collect()
        };
        self.get_path(current, &keys)
    }

    /// Resolves already split path keys.
    ///
    /// The first key of an absolute path is searched from the innermost
    /// frame outward and then in the global data; later keys descend into
    /// the value found. `$idx` and `$len` name the position and length of
    /// the nearest iteration. With `current` set, only the innermost frame
    /// is consulted, and an empty path means the innermost value itself.
    pub fn get_path<S: AsRef<str>>(&self, current: bool, keys: &[S]) -> Option<Value> {
        let Some((first, rest)) = keys.split_first() else {
            return if current {
                self.current().cloned()
            } else {
                None
            };
        };
        let first = first.as_ref();

        let found = if current {
            self.current().and_then(|head| head.child(first))
        } else {
            self.lookup(first)
        };

        let mut value = found;
        for key in rest {
            value = value.and_then(|v| v.child(key.as_ref()));
        }

        if value.is_none() {
            tracing::info!(
                reference = %keys.iter().map(AsRef::as_ref).collect::<Vec<_>>().join("."),
                template = self.template_name().unwrap_or_default(),
                "Cannot find the value for reference"
            );
        }
        value
    }

    fn lookup(&self, key: &str) -> Option<Value> {
        match key {
            "$idx" => return self.index().map(Value::from),
            "$len" => return self.length().map(Value::from),
            _ => {}
        }
        let mut frame = self.stack.as_deref();
        while let Some(f) = frame {
            if let Some(value) = f.head.child(key).filter(|_| is_container(&f.head)) {
                return Some(value);
            }
            frame = f.tail.as_deref();
        }
        self.global.child(key)
    }

    /// The most recently registered override for block `name`.
    pub fn get_block(&self, name: &str) -> Option<BlockRef> {
        let found = self.blocks.iter().rev().find_map(|program| {
            program.blocks.get(name).map(|&id| BlockRef {
                program: Rc::clone(program),
                id,
            })
        });
        if found.is_none() {
            tracing::debug!(
                block = name,
                template = self.template_name().unwrap_or_default(),
                "No block override found"
            );
        }
        found
    }

    /// Makes the blocks defined by `program` visible to everything rendered
    /// with the returned context. A program already at the end of the chain
    /// is not added twice.
    #[must_use]
    pub fn shift_blocks(&self, program: &Rc<Program>) -> Self {
        if program.blocks.is_empty()
            || self
                .blocks
                .last()
                .is_some_and(|last| Rc::ptr_eq(last, program))
        {
            return self.clone();
        }
        let mut blocks = Vec::with_capacity(self.blocks.len().saturating_add(1));
        blocks.extend(self.blocks.iter().cloned());
        blocks.push(Rc::clone(program));
        Self {
            blocks: Rc::new(blocks),
            ..self.clone()
        }
    }

    /// The whole stack as nested `{"head": .., "tail": ..}` objects, with
    /// `index` and `of` on iteration frames.
    pub fn stack_json(&self) -> serde_json::Value {
        fn frame_json(frame: &Frame) -> serde_json::Value {
            let mut map = serde_json::Map::new();
            map.insert("head".to_string(), frame.head.to_json());
            if let Some((index, length)) = frame.iteration {
                map.insert("index".to_string(), index.into());
                map.insert("of".to_string(), length.into());
            }
            if let Some(tail) = &frame.tail {
                map.insert("tail".to_string(), frame_json(tail));
            }
            serde_json::Value::Object(map)
        }
        self.stack
            .as_deref()
            .map_or(serde_json::Value::Null, frame_json)
    }

    pub const fn partial_depth(&self) -> usize {
        self.partial_depth
    }

    /// How many block overrides are being rendered inside one another.
    pub const fn block_depth(&self) -> usize {
        self.block_depth
    }

    /// The context an override body renders with.
    #[must_use]
    pub(crate) fn for_block(&self) -> Self {
        Self {
            block_depth: self.block_depth.saturating_add(1),
            ..self.clone()
        }
    }

    /// The context a partial renders with: the same global data and block
    /// chain, a stack cut down to the innermost frame, and the tag's params
    /// (if any) pushed on top.
    pub(crate) fn for_partial(&self, params: Option<Value>) -> Self {
        let stack = self.stack.as_ref().map(|frame| {
            Rc::new(Frame {
                head: frame.head.clone(),
                tail: None,
                iteration: frame.iteration,
                select: None,
            })
        });
        let base = Self {
            stack,
            global: self.global.clone(),
            blocks: Rc::clone(&self.blocks),
            template_name: self.template_name.clone(),
            partial_depth: self.partial_depth.saturating_add(1),
            block_depth: self.block_depth,
        };
        match params {
            Some(params) => base.push(params),
            None => base,
        }
    }
}

/// Only objects and arrays are searched for keys while walking the stack.
const fn is_container(value: &Value) -> bool {
    matches!(value, Value::Object(_) | Value::Array(_))
}
