use crate::{error::CurlyResult, value::Value};

/// `CurlyInterface` is the blocking face of a curly engine: add templates by
/// name, then render them straight to a `String`.
///
/// Everything here can also be done through the callback and stream APIs of
/// [`CurlyEngine`](crate::CurlyEngine); this trait exists for callers that
/// never hand out asynchronous work.
pub trait CurlyInterface {
    /// `add_template` compiles `source` and registers it as `name`, replacing
    /// any template already registered under that name.
    ///
    /// # Errors
    /// - If the source does not parse.
    fn add_template<N: AsRef<str>, S: AsRef<str>>(&self, name: N, source: S) -> CurlyResult<()>;

    /// `render_to_string` renders the template registered as `template_name`
    /// against `data` and returns the whole output.
    ///
    /// # Errors
    /// - If the template is not registered and no loader can produce it.
    /// - If a helper, partial or context function fails the render.
    /// - If some part of the output is still waiting on an asynchronous
    ///   loader once every deferred task has run.
    fn render_to_string<N: AsRef<str>, D: Into<Value>>(
        &self,
        template_name: N,
        data: D,
    ) -> CurlyResult<String>;

    /// `has_template` reports whether `name` is registered. Templates a loader
    /// could produce are not counted until they have been loaded once.
    fn has_template<N: AsRef<str>>(&self, name: N) -> bool;

    /// `remove_template` unregisters `name`, returning whether it was present.
    fn remove_template<N: AsRef<str>>(&self, name: N) -> bool;
}
