//! Event tracing with Chrome trace-event JSON export.
//!
//! [`Tracer`] records timestamped begin/end/instant events into a
//! fixed-capacity buffer whose slots (including their name and category
//! string storage) are allocated up front, so recording never allocates.
//! Once the buffer is full further events are silently dropped rather
//! than stalling the traced threads. The recorded events serialize to the
//! Chrome trace-event JSON format, viewable in `chrome://tracing` or
//! Perfetto.
//!
//! Each OS thread is assigned a small 1-based logical id the first time
//! it records an event; the id is cached in thread-local storage and
//! stays stable for the lifetime of the thread.

use parking_lot::Mutex;
use serde::Serialize;
use std::{
    cell::Cell,
    fmt, fs,
    io::{self, Write},
    path::Path,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// String capacity reserved per event slot so that typical names and
/// categories fit without reallocation.
const SLOT_STRING_CAPACITY: usize = 32;

thread_local! {
    /// Logical id of the current thread, zero until assigned.
    static THREAD_ID: Cell<u32> = const { Cell::new(0) };
}

/// Scope of an instant event.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EventScope {
    /// No explicit scope; the `"s"` key is omitted from the JSON output.
    #[default]
    Default,
    Global,
    Process,
    Thread,
}

impl EventScope {
    fn as_char(self) -> Option<char> {
        match self {
            Self::Default => None,
            Self::Global => Some('g'),
            Self::Process => Some('p'),
            Self::Thread => Some('t'),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EventPhase {
    Begin,
    End,
    Instant,
}

impl EventPhase {
    fn as_char(self) -> char {
        match self {
            Self::Begin => 'B',
            Self::End => 'E',
            Self::Instant => 'i',
        }
    }
}

#[derive(Debug)]
struct Event {
    name: String,
    category: String,
    phase: EventPhase,
    scope: EventScope,
    /// Wall-clock timestamp relative to the Unix epoch.
    timestamp: Duration,
    pid: u32,
    tid: u32,
}

impl Event {
    fn empty() -> Self {
        Self {
            name: String::with_capacity(SLOT_STRING_CAPACITY),
            category: String::with_capacity(SLOT_STRING_CAPACITY),
            phase: EventPhase::Instant,
            scope: EventScope::Default,
            timestamp: Duration::ZERO,
            pid: 0,
            tid: 0,
        }
    }

    fn record(&self) -> EventRecord<'_> {
        EventRecord {
            name: &self.name,
            cat: &self.category,
            ph: self.phase.as_char(),
            ts: self.timestamp.as_micros() as u64,
            pid: self.pid,
            tid: self.tid,
            s: self.scope.as_char(),
        }
    }
}

/// The wire form of one event in the Chrome trace-event format.
#[derive(Serialize)]
struct EventRecord<'a> {
    name: &'a str,
    cat: &'a str,
    ph: char,
    ts: u64,
    pid: u32,
    tid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    s: Option<char>,
}

#[derive(Debug)]
struct State {
    events: Vec<Event>,
    count: usize,
    next_tid: u32,
}

/// A bounded, thread-safe recorder of trace events.
#[derive(Debug)]
pub struct Tracer {
    state: Mutex<State>,
}

impl Tracer {
    /// Creates a tracer able to hold `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let events = (0..capacity).map(|_| Event::empty()).collect();
        Self {
            state: Mutex::new(State {
                events,
                count: 0,
                next_tid: 1,
            }),
        }
    }

    /// Returns the maximum number of events the tracer can hold.
    pub fn capacity(&self) -> usize {
        self.state.lock().events.len()
    }

    /// Returns the number of events currently recorded.
    pub fn count(&self) -> usize {
        self.state.lock().count
    }

    /// Discards all recorded events without deallocating their slots.
    ///
    /// Logical thread ids are kept; a thread that records again after a
    /// clear reuses its previous id.
    pub fn clear(&self) {
        self.state.lock().count = 0;
    }

    /// Records the begin of a duration with the given name and category.
    pub fn begin(&self, name: &str, category: &str) {
        self.append(name, category, EventPhase::Begin, EventScope::Default);
    }

    /// Records the end of a duration opened by a matching
    /// [`begin`](Self::begin). Pairing is the caller's responsibility.
    pub fn end(&self, name: &str, category: &str) {
        self.append(name, category, EventPhase::End, EventScope::Default);
    }

    /// Records an instantaneous event with the given scope.
    pub fn instant(&self, name: &str, category: &str, scope: EventScope) {
        self.append(name, category, EventPhase::Instant, scope);
    }

    fn append(&self, name: &str, category: &str, phase: EventPhase, scope: EventScope) {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();

        let mut state = self.state.lock();

        let tid = THREAD_ID.with(|id| {
            if id.get() == 0 {
                id.set(state.next_tid);
                state.next_tid += 1;
            }
            id.get()
        });

        if state.count == state.events.len() {
            // Buffer exhausted: drop the event rather than block or grow.
            return;
        }
        let index = state.count;
        state.count += 1;

        let event = &mut state.events[index];
        event.name.clear();
        event.name.push_str(name);
        event.category.clear();
        event.category.push_str(category);
        event.phase = phase;
        event.scope = scope;
        event.timestamp = timestamp;
        event.pid = std::process::id();
        event.tid = tid;
    }

    /// Writes all recorded events as a Chrome trace-event JSON array.
    ///
    /// # Errors
    /// [`TracerError::Io`] if the writer fails, [`TracerError::Json`] if
    /// serialization fails.
    pub fn json_write(&self, out: &mut impl Write) -> Result<(), TracerError> {
        let state = self.state.lock();
        out.write_all(b"[")?;
        for (index, event) in state.events[..state.count].iter().enumerate() {
            if index > 0 {
                out.write_all(b",\n")?;
            }
            serde_json::to_writer(&mut *out, &event.record())?;
        }
        out.write_all(b"]")?;
        Ok(())
    }

    /// Writes all recorded events as JSON to the file at `path`, creating
    /// or truncating it.
    ///
    /// # Errors
    /// [`TracerError::Io`] if the file cannot be written,
    /// [`TracerError::Json`] if serialization fails.
    pub fn json_write_file(&self, path: impl AsRef<Path>) -> Result<(), TracerError> {
        let file = fs::File::create(path)?;
        let mut writer = io::BufWriter::new(file);
        self.json_write(&mut writer)?;
        writer.flush()?;
        Ok(())
    }
}

/// Errors produced by the tracer's JSON export.
#[derive(Debug)]
pub enum TracerError {
    Io(io::Error),
    Json(serde_json::Error),
}

impl fmt::Display for TracerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "Error writing trace events: {err}"),
            Self::Json(err) => write!(f, "Error serializing trace events: {err}"),
        }
    }
}

impl std::error::Error for TracerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Json(err) => Some(err),
        }
    }
}

impl From<io::Error> for TracerError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<serde_json::Error> for TracerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err)
    }
}
