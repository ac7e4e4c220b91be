use std::{
    borrow::Cow,
    cell::{Cell, RefCell},
    fmt,
    io::Write,
    rc::Rc,
};

use crate::{
    context::Context,
    error::{CurlyError, CurlyResult},
    runtime::Body,
};

/// One piece of a render's output, linked to the piece after it.
#[derive(Default)]
struct Segment {
    data: String,
    next: Option<usize>,
    flushable: bool,
    error: Option<CurlyError>,
}

type Callback = Box<dyn FnOnce(CurlyResult<String>)>;

/// Where a render's output goes once it is ready.
enum Sink {
    /// Accumulate everything and hand it to the callback at the end.
    Stub {
        out: String,
        callback: Option<Callback>,
    },
    /// Emit every ready piece as a `data` event.
    Stream(Rc<Listeners>),
}

enum Outcome {
    Pending,
    Finished,
    Failed(CurlyError),
}

enum Delivery {
    Nothing,
    Callback(Callback, CurlyResult<String>),
    Stream(Rc<Listeners>, Vec<String>, Outcome),
}

/// All segments of one render, in an arena. `head` is the first segment not
/// yet delivered; `done` is set once the render finished or failed.
struct Root {
    segments: RefCell<Vec<Segment>>,
    head: Cell<Option<usize>>,
    done: Cell<bool>,
    sink: RefCell<Sink>,
    flushing: Cell<bool>,
    dirty: Cell<bool>,
}

impl Root {
    fn new(sink: Sink) -> Rc<Self> {
        Rc::new(Self {
            segments: RefCell::new(vec![Segment::default()]),
            head: Cell::new(Some(0)),
            done: Cell::new(false),
            sink: RefCell::new(sink),
            flushing: Cell::new(false),
            dirty: Cell::new(false),
        })
    }

    fn segment(&self, next: Option<usize>) -> usize {
        let mut segments = self.segments.borrow_mut();
        segments.push(Segment {
            next,
            ..Segment::default()
        });
        segments.len().saturating_sub(1)
    }

    fn update<F: FnOnce(&mut Segment)>(&self, id: usize, f: F) {
        if let Some(segment) = self.segments.borrow_mut().get_mut(id) {
            f(segment);
        }
    }

    /// Delivers every ready segment from the head onward. A flush requested
    /// while one is running (from inside a listener) is folded into the
    /// running one.
    fn flush(&self) {
        if self.flushing.replace(true) {
            self.dirty.set(true);
            return;
        }
        loop {
            self.dirty.set(false);
            let (data, outcome) = self.drain();
            self.deliver(data, outcome);
            if !self.dirty.get() {
                break;
            }
        }
        self.flushing.set(false);
    }

    fn drain(&self) -> (Vec<String>, Outcome) {
        let mut data = Vec::new();
        if self.done.get() {
            return (data, Outcome::Pending);
        }
        let mut segments = self.segments.borrow_mut();
        while let Some(id) = self.head.get() {
            let Some(segment) = segments.get_mut(id) else {
                break;
            };
            if let Some(error) = segment.error.take() {
                self.done.set(true);
                return (data, Outcome::Failed(error));
            } else if segment.flushable {
                if !segment.data.is_empty() {
                    data.push(std::mem::take(&mut segment.data));
                }
                self.head.set(segment.next);
            } else {
                return (data, Outcome::Pending);
            }
        }
        self.done.set(true);
        (data, Outcome::Finished)
    }

    fn deliver(&self, data: Vec<String>, outcome: Outcome) {
        let mut sink = self.sink.borrow_mut();
        let delivery = match &mut *sink {
            Sink::Stub { out, callback } => {
                for piece in &data {
                    out.push_str(piece);
                }
                let result = match outcome {
                    Outcome::Pending => None,
                    Outcome::Finished => Some(Ok(std::mem::take(out))),
                    Outcome::Failed(error) => Some(Err(error)),
                };
                result
                    .and_then(|result| {
                        callback
                            .take()
                            .map(|callback| Delivery::Callback(callback, result))
                    })
                    .unwrap_or(Delivery::Nothing)
            }
            Sink::Stream(listeners) => Delivery::Stream(Rc::clone(listeners), data, outcome),
        };
        drop(sink);

        match delivery {
            Delivery::Nothing => {}
            Delivery::Callback(callback, result) => {
                if let Err(error) = &result {
                    tracing::warn!(%error, "Render halted");
                }
                callback(result);
            }
            Delivery::Stream(listeners, data, outcome) => {
                for piece in &data {
                    listeners.data(piece);
                }
                match outcome {
                    Outcome::Pending => {}
                    Outcome::Finished => listeners.end(),
                    Outcome::Failed(error) => {
                        tracing::warn!(%error, "Render halted");
                        listeners.error(&error);
                    }
                }
            }
        }
    }
}

/// An output transform pushed with [`Chunk::tap`]. The newest tap runs
/// first.
struct Tap {
    transform: Rc<dyn Fn(&str) -> String>,
    tail: Option<Rc<Tap>>,
}

impl Tap {
    fn apply(&self, data: &str) -> String {
        let mut value = (self.transform)(data);
        let mut tap = self.tail.as_deref();
        while let Some(next) = tap {
            value = (next.transform)(&value);
            tap = next.tail.as_deref();
        }
        value
    }
}

/// A handle onto one position in a render's output.
///
/// Writes append to the chunk's segment. Segments are delivered in the order
/// they appear in the template, each once it has been [`end`](Self::end)ed
/// and everything before it has been delivered. [`map`](Self::map) reserves a
/// position for output that is produced later.
#[derive(Clone)]
pub struct Chunk {
    root: Rc<Root>,
    id: usize,
    taps: Option<Rc<Tap>>,
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk").field("id", &self.id).finish_non_exhaustive()
    }
}

impl Chunk {
    /// The head of a render that calls `callback` once with the full output
    /// or the first error.
    pub fn stub<F>(callback: F) -> Self
    where
        F: FnOnce(CurlyResult<String>) + 'static,
    {
        Self::head(Root::new(Sink::Stub {
            out: String::new(),
            callback: Some(Box::new(callback)),
        }))
    }

    fn head(root: Rc<Root>) -> Self {
        Self {
            root,
            id: 0,
            taps: None,
        }
    }

    fn at(&self, id: usize) -> Self {
        Self {
            root: Rc::clone(&self.root),
            id,
            taps: self.taps.clone(),
        }
    }

    pub fn write(self, data: &str) -> Self {
        let data = match &self.taps {
            Some(tap) => Cow::Owned(tap.apply(data)),
            None => Cow::Borrowed(data),
        };
        if !data.is_empty() {
            self.root
                .update(self.id, |segment| segment.data.push_str(&data));
        }
        self
    }

    /// Marks this chunk as complete and delivers whatever is ready.
    pub fn end(self) {
        self.root.update(self.id, |segment| segment.flushable = true);
        self.root.flush();
    }

    /// Writes `data`, then ends the chunk.
    pub fn end_with(self, data: &str) {
        self.write(data).end();
    }

    /// Fails the render at this chunk. Output before it is still delivered;
    /// the error is reported once and nothing after it is.
    pub fn set_error(self, error: CurlyError) -> Self {
        self.root.update(self.id, |segment| segment.error = Some(error));
        self.root.flush();
        self
    }

    /// Forks a branch at the current position and returns a chunk for the
    /// content after it. `producer` receives the branch and must eventually
    /// `end` it or `set_error` on it; until then nothing after the branch is
    /// delivered.
    pub fn map<F: FnOnce(Self)>(self, producer: F) -> Self {
        let next = self
            .root
            .segments
            .borrow()
            .get(self.id)
            .and_then(|segment| segment.next);
        let cursor = self.root.segment(next);
        let branch = self.root.segment(Some(cursor));
        self.root.update(self.id, |segment| {
            segment.next = Some(branch);
            segment.flushable = true;
        });
        producer(self.at(branch));
        self.at(cursor)
    }

    /// Renders into a private buffer, then passes the text and a branch at
    /// this position to `then`. The chunk `then` returns is ended for it.
    pub fn capture<R, T>(self, render: R, then: T) -> Self
    where
        R: FnOnce(Self) -> CurlyResult<Self>,
        T: FnOnce(String, Self) -> CurlyResult<Self> + 'static,
    {
        self.map(move |branch| {
            let target = branch.clone();
            let stub = Self::stub(move |result| match result {
                Ok(text) => match then(text, branch) {
                    Ok(chunk) => chunk.end(),
                    Err(error) => {
                        target.set_error(error);
                    }
                },
                Err(error) => {
                    branch.set_error(error);
                }
            });
            match render(stub.clone()) {
                Ok(chunk) => chunk.end(),
                Err(error) => {
                    stub.set_error(error);
                }
            }
        })
    }

    /// Pushes a transform applied to everything written through this handle
    /// (and handles derived from it).
    pub fn tap<F: Fn(&str) -> String + 'static>(mut self, transform: F) -> Self {
        self.taps = Some(Rc::new(Tap {
            transform: Rc::new(transform),
            tail: self.taps.take(),
        }));
        self
    }

    /// Removes the most recently pushed transform.
    pub fn untap(mut self) -> Self {
        self.taps = self.taps.and_then(|tap| tap.tail.clone());
        self
    }

    pub fn render(self, body: &Body, context: &Context) -> CurlyResult<Self> {
        body.render(self, context)
    }
}

type DataListener = Box<dyn FnMut(&str)>;
type EndListener = Box<dyn FnMut()>;
type ErrorListener = Box<dyn FnMut(&CurlyError)>;

#[derive(Default)]
struct Listeners {
    data: RefCell<Vec<DataListener>>,
    end: RefCell<Vec<EndListener>>,
    error: RefCell<Vec<ErrorListener>>,
}

/// Calls every listener in `slot` without holding the borrow, so listeners
/// may register more listeners.
fn notify<L: ?Sized, F: FnMut(&mut L)>(slot: &RefCell<Vec<Box<L>>>, mut call: F) {
    let mut listeners = std::mem::take(&mut *slot.borrow_mut());
    for listener in &mut listeners {
        call(listener);
    }
    let mut current = slot.borrow_mut();
    listeners.append(&mut current);
    *current = listeners;
}

impl Listeners {
    fn data(&self, piece: &str) {
        notify(&self.data, |listener| listener(piece));
    }

    fn end(&self) {
        notify(&self.end, |listener| listener());
    }

    fn error(&self, error: &CurlyError) {
        notify(&self.error, |listener| listener(error));
    }
}

/// Event-style access to a render's output: `data` for each ready piece in
/// order, then exactly one of `end` or `error`.
#[derive(Clone)]
pub struct Stream {
    listeners: Rc<Listeners>,
    head: Chunk,
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream").finish_non_exhaustive()
    }
}

impl Default for Stream {
    fn default() -> Self {
        Self::new()
    }
}

impl Stream {
    pub fn new() -> Self {
        let listeners = Rc::new(Listeners::default());
        let head = Chunk::head(Root::new(Sink::Stream(Rc::clone(&listeners))));
        Self { listeners, head }
    }

    /// The first chunk of the stream's render.
    pub fn head(&self) -> Chunk {
        self.head.clone()
    }

    pub fn on_data<F: FnMut(&str) + 'static>(&self, listener: F) -> &Self {
        self.listeners.data.borrow_mut().push(Box::new(listener));
        self
    }

    pub fn on_end<F: FnMut() + 'static>(&self, listener: F) -> &Self {
        self.listeners.end.borrow_mut().push(Box::new(listener));
        self
    }

    pub fn on_error<F: FnMut(&CurlyError) + 'static>(&self, listener: F) -> &Self {
        self.listeners.error.borrow_mut().push(Box::new(listener));
        self
    }

    /// Writes every piece to `writer` and flushes it at the end. Write
    /// failures are logged; they do not stop the render.
    pub fn pipe<W: Write + 'static>(&self, writer: W) -> &Self {
        let writer = Rc::new(RefCell::new(writer));
        let on_data = Rc::clone(&writer);
        self.on_data(move |piece| {
            if let Err(error) = on_data.borrow_mut().write_all(piece.as_bytes()) {
                tracing::warn!(%error, "Failed to write piped output");
            }
        });
        self.on_end(move || {
            if let Err(error) = writer.borrow_mut().flush() {
                tracing::warn!(%error, "Failed to flush piped output");
            }
        });
        self
    }
}
