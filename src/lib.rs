mod ast;
mod chunk;
mod compiler;
mod config;
mod context;
mod engine;
mod error;
mod filters;
mod helpers;
mod interface;
mod loader;
mod optimizer;
mod parser;
mod runtime;
mod scheduler;
mod value;

// Public exports.
pub use ast::{
    Identifier, Literal, Node, Param, ParamValue, PartialKind, PartialTarget, PathSegment,
    Position, SectionKind,
};
pub use chunk::{Chunk, Stream};
pub use compiler::{BodyId, FilterChain, Name, Op, ParamExpr, Program, SectionOp};
pub use config::{EngineConfig, Whitespace};
pub use context::{BlockRef, Context, SelectState};
pub use engine::{CurlyEngine, TemplateFn};
pub use error::{CurlyError, CurlyResult, ParseError, ParseErrorKind};
pub use filters::{FilterFn, encode_uri, encode_uri_component, escape_html, escape_js};
pub use helpers::{HelperFn, tap};
pub use interface::CurlyInterface;
pub use loader::{FileSystemLoader, LoadCallback, MemoryLoader, TemplateLoader};
pub use parser::parse;
pub use runtime::{Bodies, Body};
pub use value::{ContextFn, Params, Returned, Value};
