use std::{cell::RefCell, rc::Rc};

use crate::{
    chunk::{Chunk, Stream},
    compiler::Program,
    config::EngineConfig,
    context::Context,
    error::{CurlyError, CurlyResult},
    interface::CurlyInterface,
    loader::TemplateLoader,
    runtime::{Bodies, Runtime},
    value::{Params, Value},
};

/// `CurlyEngine` is the primary implementation of the `CurlyInterface` trait.
/// It owns the template registry, the helper and filter tables, the optional
/// template loader and the queue of deferred renders.
///
/// Cloning an engine is cheap and the clones share all of that state. The
/// engine is single-threaded: renders make progress when a callback fires or
/// when [`run_pending`](Self::run_pending) is called.
///
/// # Examples
///
/// ```
/// use curly::{CurlyEngine, CurlyInterface};
/// use serde_json::json;
///
/// // Create a new engine
/// let engine = CurlyEngine::new();
///
/// // Add a template
/// engine.add_template("greeting", "Hello, {name}!").unwrap();
///
/// // Render template
/// let output = engine
///     .render_to_string("greeting", json!({ "name": "<World>" }))
///     .unwrap();
/// assert_eq!(output, "Hello, &lt;World&gt;!");
/// ```
#[derive(Debug, Clone)]
pub struct CurlyEngine {
    runtime: Rc<Runtime>,
}

impl Default for CurlyEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl CurlyEngine {
    /// Creates an engine with the default configuration and the built-in
    /// helpers and filters.
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            runtime: Rc::new(Runtime::new(config)),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.runtime.config
    }

    /// Compiles `source` without registering it. A named program remembers
    /// its name, so [`load_source`](Self::load_source) can register it later;
    /// an anonymous one can only be rendered through the returned
    /// [`TemplateFn`].
    ///
    /// # Errors
    /// - If the source does not parse.
    pub fn compile<S: AsRef<str>>(&self, source: S, name: Option<&str>) -> CurlyResult<Program> {
        self.runtime.compile(source.as_ref(), name)
    }

    /// Registers a compiled program under `name`, replacing any previous one.
    pub fn register<N: Into<String>>(&self, name: N, program: Program) {
        let name = name.into();
        tracing::debug!(template = %name, "Registering template");
        self.runtime.registry.insert(name, program);
    }

    /// Makes a compiled program callable. Named programs are registered too,
    /// so partials can reach them.
    pub fn load_source(&self, program: Program) -> TemplateFn {
        let program = match program.name.clone() {
            Some(name) => self.runtime.registry.insert(name, program),
            None => Rc::new(program),
        };
        TemplateFn {
            runtime: Rc::clone(&self.runtime),
            program,
        }
    }

    /// Compiles and loads `source` in one step. Without a name the template
    /// can only be rendered through the returned [`TemplateFn`].
    ///
    /// # Errors
    /// - If the source does not parse.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::{cell::RefCell, rc::Rc};
    ///
    /// use curly::CurlyEngine;
    /// use serde_json::json;
    ///
    /// let engine = CurlyEngine::new();
    /// let template = engine.compile_fn("{#items}{.}{@sep}, {/sep}{/items}", None).unwrap();
    ///
    /// let output = Rc::new(RefCell::new(None));
    /// let sink = Rc::clone(&output);
    /// template.render(json!({ "items": ["a", "b", "c"] }), move |result| {
    ///     *sink.borrow_mut() = Some(result);
    /// });
    ///
    /// assert!(output.borrow().is_none());
    /// engine.run_pending();
    /// assert_eq!(output.borrow_mut().take().unwrap().unwrap(), "a, b, c");
    /// ```
    pub fn compile_fn<S: AsRef<str>>(&self, source: S, name: Option<&str>) -> CurlyResult<TemplateFn> {
        let program = self.compile(source, name)?;
        Ok(self.load_source(program))
    }

    /// Renders the template registered as `name` and calls `callback` once
    /// with the full output or the first error.
    ///
    /// The render starts immediately. If it needs a template that a loader
    /// produces asynchronously, `callback` fires when the loader answers.
    pub fn render<D, F>(&self, name: &str, data: D, callback: F)
    where
        D: Into<Value>,
        F: FnOnce(CurlyResult<String>) + 'static,
    {
        self.render_with_context(name, Context::new(data), callback);
    }

    /// Like [`render`](Self::render), with a prepared context so globals and
    /// extra frames can be supplied.
    pub fn render_with_context<F>(&self, name: &str, context: Context, callback: F)
    where
        F: FnOnce(CurlyResult<String>) + 'static,
    {
        let context = match context.template_name() {
            Some(_) => context,
            None => context.with_template_name(name),
        };
        self.runtime
            .load(name, Chunk::stub(callback), &context)
            .end();
    }

    /// Renders the template registered as `name` to a [`Stream`].
    ///
    /// The render is deferred until [`run_pending`](Self::run_pending), so
    /// listeners attached to the returned stream see every event.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::{cell::RefCell, rc::Rc};
    ///
    /// use curly::{CurlyEngine, CurlyInterface};
    /// use serde_json::json;
    ///
    /// let engine = CurlyEngine::new();
    /// engine.add_template("list", "{#items}<li>{.}</li>{/items}").unwrap();
    ///
    /// let output = Rc::new(RefCell::new(String::new()));
    /// let sink = Rc::clone(&output);
    /// engine
    ///     .stream("list", json!({ "items": [1, 2] }))
    ///     .on_data(move |data| sink.borrow_mut().push_str(data));
    ///
    /// assert!(output.borrow().is_empty());
    /// engine.run_pending();
    /// assert_eq!(*output.borrow(), "<li>1</li><li>2</li>");
    /// ```
    pub fn stream<D: Into<Value>>(&self, name: &str, data: D) -> Stream {
        let stream = Stream::new();
        let head = stream.head();
        let context = Context::new(data).with_template_name(name);
        let name = name.to_string();
        let runtime = Rc::downgrade(&self.runtime);
        self.runtime.scheduler.defer(move || {
            if let Some(runtime) = runtime.upgrade() {
                runtime.load(&name, head, &context).end();
            }
        });
        stream
    }

    /// Compiles an anonymous template and renders it on the next
    /// [`run_pending`](Self::run_pending). A syntax error is passed to
    /// `callback` at once rather than returned.
    pub fn render_source<S, D, F>(&self, source: S, data: D, callback: F)
    where
        S: AsRef<str>,
        D: Into<Value>,
        F: FnOnce(CurlyResult<String>) + 'static,
    {
        match self.compile_fn(source, None) {
            Ok(template) => template.render(data, callback),
            Err(error) => callback(Err(error)),
        }
    }

    /// Registers a helper available as `{@name}`, replacing any helper of the
    /// same name, built-ins included.
    ///
    /// # Examples
    ///
    /// ```
    /// use curly::{CurlyEngine, CurlyInterface};
    /// use serde_json::json;
    ///
    /// let engine = CurlyEngine::new();
    /// engine.register_helper("shout", |chunk, context, bodies, _params| {
    ///     match bodies.block() {
    ///         Some(body) => Ok(chunk.tap(|s| s.to_uppercase()).render(body, context)?.untap()),
    ///         None => Ok(chunk),
    ///     }
    /// });
    /// engine.add_template("t", "{@shout}hi {name}{/shout}!").unwrap();
    ///
    /// let output = engine.render_to_string("t", json!({ "name": "bob" })).unwrap();
    /// assert_eq!(output, "HI BOB!");
    /// ```
    pub fn register_helper<N, F>(&self, name: N, helper: F)
    where
        N: Into<String>,
        F: Fn(Chunk, &Context, &Bodies, &Params) -> CurlyResult<Chunk> + 'static,
    {
        self.runtime.register_helper(name.into(), Rc::new(helper));
    }

    /// Registers a filter available as `{name|filter}`.
    pub fn register_filter<N, F>(&self, name: N, filter: F)
    where
        N: Into<String>,
        F: Fn(&Value) -> Value + 'static,
    {
        self.runtime.register_filter(name.into(), Rc::new(filter));
    }

    /// Sets the loader asked for templates that are not registered.
    pub fn set_loader<L: TemplateLoader + 'static>(&self, loader: L) {
        self.runtime.set_loader(Some(Rc::new(loader)));
    }

    pub fn clear_loader(&self) {
        self.runtime.set_loader(None);
    }

    /// Runs deferred renders, and anything they defer, until none are left.
    /// Returns how many tasks ran.
    pub fn run_pending(&self) -> usize {
        self.runtime.scheduler.run_pending()
    }
}

impl CurlyInterface for CurlyEngine {
    /// `add_template` compiles `source` and registers it as `name`.
    ///
    /// # Arguments
    /// * `name` - The name partials and renders refer to the template by
    /// * `source` - The template text
    ///
    /// # Returns
    /// * `Ok(())` - If the template compiled
    /// * `Err(CurlyError::Parse)` - If it did not; nothing is registered
    ///
    /// # Examples
    ///
    /// ```
    /// use curly::{CurlyEngine, CurlyError, CurlyInterface};
    ///
    /// let engine = CurlyEngine::new();
    /// assert!(engine.add_template("ok", "{#a}x{/a}").is_ok());
    ///
    /// let error = engine.add_template("broken", "{#a}x{/b}").unwrap_err();
    /// assert!(matches!(error, CurlyError::Parse(_)));
    /// assert!(!engine.has_template("broken"));
    /// ```
    fn add_template<N: AsRef<str>, S: AsRef<str>>(&self, name: N, source: S) -> CurlyResult<()> {
        let name = name.as_ref();
        let program = self.compile(source, Some(name))?;
        self.register(name, program);
        Ok(())
    }

    /// `render_to_string` renders a registered template, runs any deferred
    /// work, and returns the output.
    ///
    /// # Arguments
    /// * `template_name` - The name of the template to render
    /// * `data` - The data the template is rendered against
    ///
    /// # Returns
    /// * `Ok(String)` - The rendered output
    /// * `Err(CurlyError::MissingTemplate)` - If the template is unknown
    /// * `Err(CurlyError::Pending)` - If a loader has not answered yet
    ///
    /// # Examples
    ///
    /// ```
    /// use curly::{CurlyEngine, CurlyError, CurlyInterface};
    /// use serde_json::json;
    ///
    /// let engine = CurlyEngine::new();
    /// engine.add_template("page", "{>header/}<p>{body}</p>").unwrap();
    /// engine.add_template("header", "<h1>{title}</h1>").unwrap();
    ///
    /// let output = engine
    ///     .render_to_string("page", json!({ "title": "Hi", "body": "text" }))
    ///     .unwrap();
    /// assert_eq!(output, "<h1>Hi</h1><p>text</p>");
    ///
    /// assert!(matches!(
    ///     engine.render_to_string("nope", json!({})),
    ///     Err(CurlyError::MissingTemplate { .. })
    /// ));
    /// ```
    fn render_to_string<N: AsRef<str>, D: Into<Value>>(
        &self,
        template_name: N,
        data: D,
    ) -> CurlyResult<String> {
        let template_name = template_name.as_ref();
        let slot = Rc::new(RefCell::new(None));
        let sink = Rc::clone(&slot);
        self.render(template_name, data, move |result| {
            *sink.borrow_mut() = Some(result);
        });
        self.run_pending();

        let result = slot.borrow_mut().take();
        result.unwrap_or_else(|| {
            Err(CurlyError::Pending {
                template_name: template_name.to_string(),
            })
        })
    }

    fn has_template<N: AsRef<str>>(&self, name: N) -> bool {
        self.runtime.registry.contains(name.as_ref())
    }

    fn remove_template<N: AsRef<str>>(&self, name: N) -> bool {
        self.runtime.registry.remove(name.as_ref()).is_some()
    }
}

/// A compiled template bound to the engine that loaded it, returned by
/// [`CurlyEngine::load_source`] and [`CurlyEngine::compile_fn`].
#[derive(Debug, Clone)]
pub struct TemplateFn {
    runtime: Rc<Runtime>,
    program: Rc<Program>,
}

impl TemplateFn {
    pub fn name(&self) -> Option<&str> {
        self.program.name.as_deref()
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    fn context<D: Into<Value>>(&self, data: D) -> Context {
        let context = Context::new(data);
        match self.name() {
            Some(name) => context.with_template_name(name),
            None => context,
        }
    }

    /// Renders the template and calls `callback` once with the full output or
    /// the first error. The render starts on the engine's next
    /// [`run_pending`](CurlyEngine::run_pending), so everything set up after
    /// this call is in place before the first write.
    pub fn render<D, F>(&self, data: D, callback: F)
    where
        D: Into<Value>,
        F: FnOnce(CurlyResult<String>) + 'static,
    {
        let head = Chunk::stub(callback);
        self.defer(head, self.context(data));
    }

    /// Renders the template to a [`Stream`]. Like [`CurlyEngine::stream`],
    /// the render waits for the engine's next
    /// [`run_pending`](CurlyEngine::run_pending).
    pub fn stream<D: Into<Value>>(&self, data: D) -> Stream {
        let stream = Stream::new();
        self.defer(stream.head(), self.context(data));
        stream
    }

    fn defer(&self, head: Chunk, context: Context) {
        let program = Rc::clone(&self.program);
        let runtime = Rc::downgrade(&self.runtime);
        self.runtime.scheduler.defer(move || {
            if let Some(runtime) = runtime.upgrade() {
                runtime.run_template(&program, head, &context).end();
            }
        });
    }
}
