//! Template sources consulted when a render asks for a name that has not been
//! registered.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use crate::error::{CurlyError, CurlyResult};

/// Receives the template source, or the reason it could not be produced.
pub type LoadCallback = Box<dyn FnOnce(CurlyResult<String>)>;

/// Produces template source for names missing from the registry.
///
/// The callback may be invoked before `load` returns or at any later point;
/// the render waits at the partial's position until it is.
pub trait TemplateLoader {
    fn load(&self, name: &str, done: LoadCallback);
}

impl<F> TemplateLoader for F
where
    F: Fn(&str, LoadCallback),
{
    fn load(&self, name: &str, done: LoadCallback) {
        self(name, done);
    }
}

/// Loads templates from an in-memory map.
#[derive(Debug, Clone, Default)]
pub struct MemoryLoader {
    templates: HashMap<String, String>,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<N: Into<String>, S: Into<String>>(&mut self, name: N, source: S) -> &mut Self {
        self.templates.insert(name.into(), source.into());
        self
    }

    pub fn with_templates<I, N, S>(templates: I) -> Self
    where
        I: IntoIterator<Item = (N, S)>,
        N: Into<String>,
        S: Into<String>,
    {
        let mut loader = Self::new();
        for (name, source) in templates {
            loader.add(name, source);
        }
        loader
    }
}

impl TemplateLoader for MemoryLoader {
    fn load(&self, name: &str, done: LoadCallback) {
        done(self.templates.get(name).cloned().ok_or_else(|| {
            CurlyError::Loader {
                template_name: name.to_string(),
                message: "no such template".to_string(),
            }
        }));
    }
}

/// Loads templates from files under a root directory.
///
/// A name without an extension gets the configured one appended, so
/// `{>"mail/footer"/}` reads `<root>/mail/footer.tl` with the extension
/// `tl`.
#[derive(Debug, Clone)]
pub struct FileSystemLoader {
    root: PathBuf,
    extension: Option<String>,
}

impl FileSystemLoader {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            root: root.into(),
            extension: None,
        }
    }

    #[must_use]
    pub fn with_extension<S: Into<String>>(mut self, extension: S) -> Self {
        self.extension = Some(extension.into());
        self
    }

    pub fn resolve(&self, name: &str) -> PathBuf {
        let path = self.root.join(name);
        match &self.extension {
            Some(extension) if Path::new(name).extension().is_none() => {
                path.with_extension(extension)
            }
            _ => path,
        }
    }
}

impl TemplateLoader for FileSystemLoader {
    fn load(&self, name: &str, done: LoadCallback) {
        let path = self.resolve(name);
        tracing::debug!(template = name, path = %path.display(), "Loading template from disk");
        done(
            std::fs::read_to_string(&path).map_err(|error| CurlyError::Loader {
                template_name: name.to_string(),
                message: format!("{}: {error}", path.display()),
            }),
        );
    }
}
