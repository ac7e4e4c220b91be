use std::{
    cell::RefCell,
    collections::HashMap,
    fmt,
    rc::Rc,
};

use crate::{
    ast::{Identifier, Literal, PathSegment},
    chunk::Chunk,
    compiler::{BodyId, Compiler, FilterChain, Name, Op, ParamExpr, Program, SectionOp},
    config::EngineConfig,
    context::Context,
    error::{CurlyError, CurlyResult},
    filters::{self, FilterFn},
    helpers::{self, HelperFn},
    loader::TemplateLoader,
    optimizer::{OptimizerOptions, optimize},
    parser::parse,
    scheduler::Scheduler,
    value::{ContextFn, Params, Returned, Value},
};

/// Name → program map. Registering a name again replaces the old program;
/// renders already holding it keep using it.
#[derive(Debug, Default)]
pub struct Registry {
    templates: RefCell<HashMap<String, Rc<Program>>>,
}

impl Registry {
    pub fn insert<N: Into<String>>(&self, name: N, program: Program) -> Rc<Program> {
        let program = Rc::new(program);
        self.templates
            .borrow_mut()
            .insert(name.into(), Rc::clone(&program));
        program
    }

    pub fn get(&self, name: &str) -> Option<Rc<Program>> {
        self.templates.borrow().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.templates.borrow().contains_key(name)
    }

    pub fn remove(&self, name: &str) -> Option<Rc<Program>> {
        self.templates.borrow_mut().remove(name)
    }
}

/// Everything a render needs: registered templates, helpers, filters, the
/// loader and the deferred task queue.
pub(crate) struct Runtime {
    pub registry: Registry,
    helpers: RefCell<HashMap<String, HelperFn>>,
    filters: RefCell<HashMap<String, FilterFn>>,
    loader: RefCell<Option<Rc<dyn TemplateLoader>>>,
    pub scheduler: Scheduler,
    pub config: EngineConfig,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            registry: Registry::default(),
            helpers: RefCell::new(
                helpers::builtins()
                    .into_iter()
                    .map(|(name, helper)| (name.to_string(), helper))
                    .collect(),
            ),
            filters: RefCell::new(
                filters::builtins()
                    .into_iter()
                    .map(|(name, filter)| (name.to_string(), filter))
                    .collect(),
            ),
            loader: RefCell::new(None),
            scheduler: Scheduler::default(),
            config,
        }
    }

    pub fn compile(&self, source: &str, name: Option<&str>) -> CurlyResult<Program> {
        let ast = parse(source)?;
        let ast = optimize(ast, &OptimizerOptions::from(&self.config));
        let program = Compiler::new(name.map(str::to_string), self.config.auto_escape.clone())
            .compile(&ast);
        tracing::debug!(
            template = name.unwrap_or_default(),
            bodies = program.bodies.len(),
            "Compiled template"
        );
        Ok(program)
    }

    pub fn register_helper(&self, name: String, helper: HelperFn) {
        self.helpers.borrow_mut().insert(name, helper);
    }

    pub fn register_filter(&self, name: String, filter: FilterFn) {
        self.filters.borrow_mut().insert(name, filter);
    }

    pub fn set_loader(&self, loader: Option<Rc<dyn TemplateLoader>>) {
        *self.loader.borrow_mut() = loader;
    }

    /// Renders the template registered as `name` into `chunk`. When it is not
    /// registered the loader is asked for its source; the output waits at
    /// this position until the loader answers.
    pub fn load(self: &Rc<Self>, name: &str, chunk: Chunk, context: &Context) -> Chunk {
        if let Some(program) = self.registry.get(name) {
            return self.run_template(&program, chunk, context);
        }
        let loader = self.loader.borrow().clone();
        let Some(loader) = loader else {
            return chunk.set_error(CurlyError::MissingTemplate {
                template_name: name.to_string(),
            });
        };

        tracing::debug!(template = name, "Loading template");
        let runtime = Rc::clone(self);
        let context = context.clone();
        let name = name.to_string();
        chunk.map(move |branch| {
            let template = name.clone();
            loader.load(
                &name,
                Box::new(move |source| {
                    let program = source.and_then(|source| match runtime.registry.get(&template) {
                        Some(program) => Ok(program),
                        None => runtime
                            .compile(&source, Some(template.as_str()))
                            .map(|program| runtime.registry.insert(template.clone(), program)),
                    });
                    match program {
                        Ok(program) => runtime.run_template(&program, branch, &context).end(),
                        Err(error) => {
                            branch.set_error(error);
                        }
                    }
                }),
            );
        })
    }

    /// Renders the root body of `program`. Only here do the program's own
    /// `{<name}` blocks join the block chain.
    pub fn run_template(self: &Rc<Self>, program: &Rc<Program>, chunk: Chunk, context: &Context) -> Chunk {
        let context = context.shift_blocks(program);
        match self.run_body(program, program.root, chunk.clone(), &context) {
            Ok(chunk) => chunk,
            Err(error) => chunk.set_error(error),
        }
    }

    pub fn run_body(
        self: &Rc<Self>,
        program: &Rc<Program>,
        id: BodyId,
        chunk: Chunk,
        context: &Context,
    ) -> CurlyResult<Chunk> {
        let mut chunk = chunk;
        for op in program.body(id) {
            chunk = self.run_op(program, op, chunk, context)?;
        }
        Ok(chunk)
    }

    fn run_op(
        self: &Rc<Self>,
        program: &Rc<Program>,
        op: &Op,
        chunk: Chunk,
        context: &Context,
    ) -> CurlyResult<Chunk> {
        match op {
            Op::Write(text) => Ok(chunk.write(text)),
            Op::Reference {
                identifier,
                filters,
            } => Ok(self.reference(chunk, context, identifier, filters)),
            Op::Section {
                kind,
                identifier,
                context: rebase,
                params,
                bodies,
            } => {
                let value = resolve(context, identifier);
                let params = self.params(program, context, params);
                let bodies = self.bodies(program, bodies);
                let scoped = scoped(context, rebase.as_ref());
                match kind {
                    SectionOp::Section => self.section(chunk, &scoped, value, &bodies, &params),
                    SectionOp::Exists => exists(chunk, &scoped, value.as_ref(), &bodies),
                    SectionOp::NotExists => not_exists(chunk, &scoped, value.as_ref(), &bodies),
                }
            }
            Op::Block {
                name,
                context: rebase,
                params: _,
                bodies,
            } => {
                let name = self.name(program, name, context);
                let bodies = self.bodies(program, bodies);
                let scoped = scoped(context, rebase.as_ref());
                match scoped.get_block(&name) {
                    Some(_) if scoped.block_depth() >= self.config.max_partial_depth => {
                        Ok(chunk.set_error(CurlyError::RecursiveBlock {
                            block: name,
                            max_depth: self.config.max_partial_depth,
                        }))
                    }
                    Some(block) => {
                        self.run_body(&block.program, block.id, chunk, &scoped.for_block())
                    }
                    None => match bodies.block() {
                        Some(body) => body.render(chunk, &scoped),
                        None => Ok(chunk),
                    },
                }
            }
            Op::Helper {
                name,
                context: rebase,
                params,
                bodies,
            } => {
                let helper = self.helpers.borrow().get(name).cloned();
                let Some(helper) = helper else {
                    tracing::warn!(helper = %name, "Invalid helper");
                    return Ok(chunk);
                };
                let params = self.params(program, context, params);
                let bodies = self.bodies(program, bodies);
                let scoped = scoped(context, rebase.as_ref());
                match helper(chunk.clone(), &scoped, &bodies, &params) {
                    Ok(chunk) => Ok(chunk),
                    Err(error) => {
                        tracing::error!(helper = %name, %error, "Helper failed");
                        Ok(chunk)
                    }
                }
            }
            Op::Partial {
                name,
                context: rebase,
                params,
            } => {
                let params = self.params(program, context, params);
                let partial = scoped(context, rebase.as_ref())
                    .for_partial((!params.is_empty()).then(|| Value::from(params)));
                Ok(self.partial(program, name, chunk, partial))
            }
        }
    }

    fn reference(
        &self,
        chunk: Chunk,
        context: &Context,
        identifier: &Identifier,
        filters: &FilterChain,
    ) -> Chunk {
        let value = match resolve(context, identifier) {
            Some(Value::Function(function)) => {
                match function.call(chunk.clone(), context, &Bodies::default(), &Params::new()) {
                    Ok(Returned::Chunk(chunk)) => return chunk,
                    Ok(Returned::Value(value)) => value,
                    Err(error) => {
                        tracing::error!(reference = %identifier.text(), %error, "Context function failed");
                        return chunk;
                    }
                }
            }
            Some(value) => value,
            None => return chunk,
        };
        if value.is_empty() {
            return chunk;
        }
        chunk.write(&self.apply_filters(value, filters))
    }

    /// Runs the explicit filters left to right, then the auto-escape filter
    /// unless `s` appeared among them.
    pub fn apply_filters(&self, value: Value, chain: &FilterChain) -> String {
        let mut auto = chain.auto.as_deref();
        let mut value = value;
        for name in &chain.filters {
            if name == "s" {
                auto = None;
                continue;
            }
            value = self.filter(name, value);
        }
        if let Some(name) = auto {
            value = self.filter(name, value);
        }
        value.to_string()
    }

    fn filter(&self, name: &str, value: Value) -> Value {
        let filter = self.filters.borrow().get(name).cloned();
        match filter {
            Some(filter) => filter(&value),
            None => {
                tracing::warn!(filter = name, "Invalid filter");
                value
            }
        }
    }

    fn section(
        &self,
        chunk: Chunk,
        context: &Context,
        value: Option<Value>,
        bodies: &Bodies,
        params: &Params,
    ) -> CurlyResult<Chunk> {
        let value = match value {
            Some(Value::Function(function)) if !function.is_body() => {
                match function.call(chunk.clone(), context, bodies, params) {
                    Ok(Returned::Chunk(chunk)) => return Ok(chunk),
                    Ok(Returned::Value(value)) => Some(value),
                    Err(error) => {
                        tracing::error!(%error, "Context function failed");
                        return Ok(chunk);
                    }
                }
            }
            value @ (Some(_) | None) => value,
        };

        let context = if params.is_empty() {
            context.clone()
        } else {
            context.push(Value::from(params.clone()))
        };
        let (body, skip) = (bodies.block(), bodies.else_body());

        match value {
            Some(Value::Array(items)) => {
                if let Some(body) = body {
                    if !items.is_empty() {
                        let length = items.len();
                        let mut chunk = chunk;
                        for (index, item) in items.iter().enumerate() {
                            chunk = body.render(
                                chunk,
                                &context.push_indexed(item.clone(), index, length),
                            )?;
                        }
                        return Ok(chunk);
                    }
                    if let Some(skip) = skip {
                        return skip.render(chunk, &context);
                    }
                }
            }
            Some(Value::Bool(true)) => {
                if let Some(body) = body {
                    return body.render(chunk, &context);
                }
            }
            Some(value) if value.is_truthy() => {
                if let Some(body) = body {
                    return body.render(chunk, &context.push(value));
                }
            }
            None | Some(_) => {
                if let Some(skip) = skip {
                    return skip.render(chunk, &context);
                }
            }
        }
        tracing::debug!(
            template = context.template_name().unwrap_or_default(),
            "Not rendering section (#) block, because the key was not found"
        );
        Ok(chunk)
    }

    fn partial(
        self: &Rc<Self>,
        program: &Rc<Program>,
        name: &Name,
        chunk: Chunk,
        context: Context,
    ) -> Chunk {
        if context.partial_depth() > self.config.max_partial_depth {
            let template_name = match name {
                Name::Literal(name) => name.clone(),
                Name::Body(_) => context.template_name().unwrap_or_default().to_string(),
            };
            return chunk.set_error(CurlyError::RecursivePartial {
                template_name,
                max_depth: self.config.max_partial_depth,
            });
        }
        match name {
            Name::Literal(name) => self.load(name, chunk, &context.with_template_name(name)),
            Name::Body(id) => {
                let runtime = Rc::clone(self);
                let partial = context.clone();
                chunk.capture(
                    |inner| self.run_body(program, *id, inner, &context),
                    move |name, branch| {
                        let context = partial.with_template_name(&name);
                        Ok(runtime.load(&name, branch, &context))
                    },
                )
            }
        }
    }

    /// A block or partial name, rendering it first when it contains
    /// references.
    fn name(self: &Rc<Self>, program: &Rc<Program>, name: &Name, context: &Context) -> String {
        match name {
            Name::Literal(name) => name.clone(),
            Name::Body(id) => self.render_text(program, *id, context),
        }
    }

    /// Renders a body on its own and returns the text. Anything that does not
    /// finish synchronously is left out.
    fn render_text(self: &Rc<Self>, program: &Rc<Program>, id: BodyId, context: &Context) -> String {
        let text = Rc::new(RefCell::new(String::new()));
        let sink = Rc::clone(&text);
        let chunk = Chunk::stub(move |result| match result {
            Ok(out) => *sink.borrow_mut() = out,
            Err(error) => tracing::warn!(%error, "Failed to render name"),
        });
        match self.run_body(program, id, chunk.clone(), context) {
            Ok(chunk) => chunk.end(),
            Err(error) => {
                chunk.set_error(error);
            }
        }
        text.take()
    }

    fn params(
        self: &Rc<Self>,
        program: &Rc<Program>,
        context: &Context,
        params: &[(String, ParamExpr)],
    ) -> Params {
        params
            .iter()
            .filter_map(|(key, expr)| {
                let value = match expr {
                    ParamExpr::Literal(literal) => Some(literal_value(literal)),
                    ParamExpr::Identifier(identifier) => resolve(context, identifier),
                    ParamExpr::Body(id) => {
                        let body = self.body(program, *id);
                        Some(Value::Function(ContextFn::body(move |chunk, context, _, _| {
                            body.render(chunk, context).map(Returned::Chunk)
                        })))
                    }
                };
                value.map(|value| (key.clone(), value))
            })
            .collect()
    }

    fn body(self: &Rc<Self>, program: &Rc<Program>, id: BodyId) -> Body {
        Body {
            runtime: Rc::clone(self),
            program: Rc::clone(program),
            id,
        }
    }

    fn bodies(self: &Rc<Self>, program: &Rc<Program>, bodies: &[(String, BodyId)]) -> Bodies {
        Bodies {
            entries: bodies
                .iter()
                .map(|(name, id)| (name.clone(), self.body(program, *id)))
                .collect(),
        }
    }
}

/// Resolves an identifier. Bracketed lookups are resolved first and used by
/// their rendered text.
fn resolve(context: &Context, identifier: &Identifier) -> Option<Value> {
    match identifier {
        Identifier::Key(key) => context.get_path(false, &[key.as_str()]),
        Identifier::Path { current, segments } => {
            let keys = segments
                .iter()
                .map(|segment| match segment {
                    PathSegment::Key(key) | PathSegment::Index(key) => Some(key.clone()),
                    PathSegment::Lookup(inner) => resolve(context, inner).map(|v| v.to_string()),
                })
                .collect::<Option<Vec<String>>>()?;
            context.get_path(*current, &keys)
        }
    }
}

/// The context a tag's bodies render with: rebased onto the `:name` value
/// when one is given.
fn scoped(context: &Context, rebase: Option<&Identifier>) -> Context {
    match rebase {
        Some(identifier) => context.rebase(resolve(context, identifier).unwrap_or_default()),
        None => context.clone(),
    }
}

fn literal_value(literal: &Literal) -> Value {
    match literal {
        Literal::String(s) => Value::from(s.as_str()),
        Literal::Integer(i) => Value::from(*i),
        Literal::Float(f) => Value::from(*f),
    }
}

fn exists(chunk: Chunk, context: &Context, value: Option<&Value>, bodies: &Bodies) -> CurlyResult<Chunk> {
    let present = value.is_some_and(|value| !value.is_empty());
    let body = if present {
        bodies.block()
    } else {
        bodies.else_body()
    };
    match body {
        Some(body) => body.render(chunk, context),
        None => {
            tracing::debug!(
                template = context.template_name().unwrap_or_default(),
                "Not rendering exists (?) block, because the key was not found"
            );
            Ok(chunk)
        }
    }
}

fn not_exists(chunk: Chunk, context: &Context, value: Option<&Value>, bodies: &Bodies) -> CurlyResult<Chunk> {
    let absent = value.is_none_or(Value::is_empty);
    let body = if absent {
        bodies.block()
    } else {
        bodies.else_body()
    };
    match body {
        Some(body) => body.render(chunk, context),
        None => {
            tracing::debug!(
                template = context.template_name().unwrap_or_default(),
                "Not rendering not exists (^) block, because the key was found"
            );
            Ok(chunk)
        }
    }
}

/// One compiled body, renderable into any chunk with any context.
#[derive(Clone)]
pub struct Body {
    runtime: Rc<Runtime>,
    program: Rc<Program>,
    id: BodyId,
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Body")
            .field("template", &self.program.name)
            .field("id", &self.id)
            .finish()
    }
}

impl Body {
    pub fn render(&self, chunk: Chunk, context: &Context) -> CurlyResult<Chunk> {
        self.runtime.run_body(&self.program, self.id, chunk, context)
    }
}

/// The named bodies of a section or helper tag: `block` for the main body,
/// `else` for the `{:else}` branch, and any other `{:name}` branches.
#[derive(Debug, Clone, Default)]
pub struct Bodies {
    entries: Vec<(String, Body)>,
}

impl Bodies {
    pub fn get(&self, name: &str) -> Option<&Body> {
        self.entries
            .iter()
            .find_map(|(key, body)| (key == name).then_some(body))
    }

    /// The main body.
    pub fn block(&self) -> Option<&Body> {
        self.get("block")
    }

    pub fn else_body(&self) -> Option<&Body> {
        self.get("else")
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
