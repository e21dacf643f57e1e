//! Cyclic dataflow execution over a directed acyclic graph of tasks.
//!
//! A [`TaskFlow`] runs a user-defined DAG of named tasks on a fixed pool
//! of worker threads. One *cycle* executes every task exactly once, with
//! each task firing only after all of its dependencies have completed the
//! same cycle. When the last sink task of a cycle finishes, the flow
//! either restarts the source tasks to begin the next cycle or stops,
//! once the requested number of cycles has run or a stop was requested.
//! An optional [`Tracer`] records a begin/end event pair around every
//! task execution.
//!
//! Tasks and dependencies may only be added while the flow is stopped;
//! execution control (`stop`, `wait`, `status`) and introspection are
//! available at any time.
//!
//! # Examples
//! ```
//! # use conflux_flow::TaskFlow;
//! # use std::{
//! #     num::NonZeroUsize,
//! #     sync::{Arc, atomic::{AtomicUsize, Ordering}},
//! #     time::Duration,
//! # };
//! #
//! let flow = TaskFlow::new(NonZeroUsize::new(2).unwrap(), None);
//!
//! let count = Arc::new(AtomicUsize::new(0));
//! let counter = Arc::clone(&count);
//! let produce = flow
//!     .add_task("produce", move || {
//!         counter.fetch_add(1, Ordering::Relaxed);
//!     })
//!     .unwrap();
//! let consume = flow.add_task("consume", || {}).unwrap();
//! flow.add_dependency(consume, produce).unwrap();
//!
//! flow.start(3).unwrap();
//! flow.wait(Duration::ZERO).unwrap();
//!
//! assert_eq!(count.load(Ordering::Relaxed), 3);
//! let status = flow.status();
//! assert!(!status.running);
//! assert_eq!(status.cycles_run, 3);
//! ```

mod graph;

use conflux_containers::HashMap;
use conflux_queue::{QueueError, QueueResult};
use conflux_thread::{JobSender, ThreadPool};
use conflux_tracer::Tracer;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::{
    any::Any,
    fmt,
    num::NonZeroUsize,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

/// Category under which task executions are recorded in the tracer.
const TASK_CATEGORY: &str = "task";

/// Capacity of the worker pool's job queue. Raised to the worker count
/// when a flow is created with more workers than this.
const POOL_QUEUE_CAPACITY: NonZeroUsize = NonZeroUsize::new(32).unwrap();

/// Stand-in for "wait forever" when a zero timeout is supplied.
const EFFECTIVELY_INFINITE: Duration = Duration::from_secs(50 * 365 * 24 * 60 * 60);

static NEXT_FLOW_ID: AtomicU64 = AtomicU64::new(1);

pub type FlowResult<T> = Result<T, FlowError>;

/// Errors returned by [`TaskFlow`] operations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FlowError {
    /// The operation requires a stopped flow.
    AlreadyRunning,
    /// The operation requires a running flow.
    NotRunning,
    /// `start` was called before any task was added.
    NoTasks,
    /// Task names must be non-empty.
    EmptyName,
    /// A task with this name already exists in the flow.
    DuplicateName(String),
    /// The task handle does not refer to a task of this flow.
    UnknownTask,
    /// A task cannot depend on itself.
    SelfDependency,
    /// The dependency edge is already present.
    DuplicateDependency,
    /// The dependency edges form a cycle, which could never fire.
    CyclicDependencies,
    /// A timed wait elapsed before the flow stopped.
    TimedOut,
    /// Scheduling a task on the worker pool failed.
    Enqueue(QueueError),
}

impl fmt::Display for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyRunning => write!(f, "Task flow is already running"),
            Self::NotRunning => write!(f, "Task flow is not running"),
            Self::NoTasks => write!(f, "No tasks have been added"),
            Self::EmptyName => write!(f, "Task name cannot be empty"),
            Self::DuplicateName(name) => write!(f, "Task name '{name}' is already present"),
            Self::UnknownTask => write!(f, "Task handle does not belong to this flow"),
            Self::SelfDependency => write!(f, "Task cannot depend on itself"),
            Self::DuplicateDependency => write!(f, "Dependency is already set"),
            Self::CyclicDependencies => write!(f, "Found circular task dependencies"),
            Self::TimedOut => write!(f, "Timed out waiting for task flow to stop"),
            Self::Enqueue(err) => write!(f, "Failed to schedule task: {err}"),
        }
    }
}

impl std::error::Error for FlowError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Enqueue(err) => Some(err),
            _ => None,
        }
    }
}

/// Handle to a task registered in a [`TaskFlow`].
///
/// Handles are only meaningful to the flow that created them; passing a
/// handle to another flow fails with [`FlowError::UnknownTask`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskId {
    flow: u64,
    index: usize,
}

/// Point-in-time snapshot of a flow's execution state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaskFlowStatus {
    /// Whether the flow is currently executing cycles.
    pub running: bool,
    /// Number of cycles requested by `start` (zero means unlimited).
    pub cycles_target: u64,
    /// Number of cycles fully completed so far.
    pub cycles_run: u64,
}

type TaskFn = Arc<dyn Fn() + Send + Sync>;
type StopCallback = Arc<dyn Fn(TaskFlowStatus) + Send + Sync>;

/// Opaque per-task user data.
pub type TaskUdata = Arc<dyn Any + Send + Sync>;

pub(crate) struct TaskNode {
    pub(crate) name: Arc<str>,
    pub(crate) func: TaskFn,
    /// Indices of the tasks this one depends on.
    pub(crate) inputs: Vec<usize>,
    /// Indices of the tasks depending on this one.
    pub(crate) outputs: Vec<usize>,
    /// Cycle witness: number of times the task body has returned since
    /// the flow was started.
    pub(crate) completed_cycles: u64,
    pub(crate) udata: Option<TaskUdata>,
}

struct FlowState {
    tasks: Vec<TaskNode>,
    names: HashMap<Arc<str>, usize>,
    sources: Vec<usize>,
    sinks: Vec<usize>,
    cycles_target: u64,
    cycles_run: u64,
    /// Sinks that have completed in the current cycle.
    run_sinks: usize,
    stop: bool,
    running: bool,
    stop_callback: Option<StopCallback>,
}

impl FlowState {
    fn new() -> Self {
        Self {
            tasks: Vec::new(),
            names: HashMap::default(),
            sources: Vec::new(),
            sinks: Vec::new(),
            cycles_target: 0,
            cycles_run: 0,
            run_sinks: 0,
            stop: false,
            running: false,
            stop_callback: None,
        }
    }

    fn status(&self) -> TaskFlowStatus {
        TaskFlowStatus {
            running: self.running,
            cycles_target: self.cycles_target,
            cycles_run: self.cycles_run,
        }
    }
}

struct FlowShared {
    id: u64,
    tracer: Option<Arc<Tracer>>,
    sender: JobSender,
    state: Mutex<FlowState>,
    stopped: Condvar,
}

/// A multi-threaded executor for a DAG of interdependent tasks.
pub struct TaskFlow {
    // Dropped before `shared`, closing the job queue so that in-flight
    // wrappers stop scheduling and the workers drain and exit.
    pool: ThreadPool,
    shared: Arc<FlowShared>,
}

impl TaskFlow {
    /// Creates a stopped flow executing on `n_workers` threads.
    ///
    /// When a tracer is supplied, every task execution records a
    /// begin/end event pair under the `"task"` category.
    pub fn new(n_workers: NonZeroUsize, tracer: Option<Arc<Tracer>>) -> Self {
        let pool = ThreadPool::new(n_workers, POOL_QUEUE_CAPACITY.max(n_workers));
        let shared = Arc::new(FlowShared {
            id: NEXT_FLOW_ID.fetch_add(1, Ordering::Relaxed),
            tracer,
            sender: pool.sender(),
            state: Mutex::new(FlowState::new()),
            stopped: Condvar::new(),
        });
        Self { pool, shared }
    }

    /// Returns the tracer supplied at construction, if any.
    pub fn tracer(&self) -> Option<&Arc<Tracer>> {
        self.shared.tracer.as_ref()
    }

    /// Returns the number of worker threads executing tasks.
    pub fn n_workers(&self) -> usize {
        self.pool.n_workers()
    }

    /// Adds a named task to the flow.
    ///
    /// The task body runs once per cycle, on an arbitrary worker thread.
    ///
    /// # Errors
    /// - [`FlowError::AlreadyRunning`] if the flow is running.
    /// - [`FlowError::EmptyName`] if `name` is empty.
    /// - [`FlowError::DuplicateName`] if the name is already taken.
    pub fn add_task(
        &self,
        name: &str,
        func: impl Fn() + Send + Sync + 'static,
    ) -> FlowResult<TaskId> {
        let mut state = self.shared.state.lock();
        if state.running {
            return Err(FlowError::AlreadyRunning);
        }
        if name.is_empty() {
            return Err(FlowError::EmptyName);
        }
        if state.names.contains_key(name) {
            return Err(FlowError::DuplicateName(name.to_owned()));
        }

        let index = state.tasks.len();
        let name: Arc<str> = Arc::from(name);
        state.names.insert(Arc::clone(&name), index);
        state.tasks.push(TaskNode {
            name,
            func: Arc::new(func),
            inputs: Vec::new(),
            outputs: Vec::new(),
            completed_cycles: 0,
            udata: None,
        });

        Ok(TaskId {
            flow: self.shared.id,
            index,
        })
    }

    /// Makes `task` depend on `dependency`: each cycle, `task` fires only
    /// after `dependency` (and every other input of `task`) completed.
    ///
    /// # Errors
    /// - [`FlowError::AlreadyRunning`] if the flow is running.
    /// - [`FlowError::UnknownTask`] if either handle is foreign.
    /// - [`FlowError::SelfDependency`] if both handles name the same task.
    /// - [`FlowError::DuplicateDependency`] if the edge already exists.
    pub fn add_dependency(&self, task: TaskId, dependency: TaskId) -> FlowResult<()> {
        let mut state = self.shared.state.lock();
        if state.running {
            return Err(FlowError::AlreadyRunning);
        }
        let task_index = self.resolve(&state, task)?;
        let dependency_index = self.resolve(&state, dependency)?;
        if task_index == dependency_index {
            return Err(FlowError::SelfDependency);
        }
        if state.tasks[task_index].inputs.contains(&dependency_index) {
            return Err(FlowError::DuplicateDependency);
        }

        state.tasks[task_index].inputs.push(dependency_index);
        state.tasks[dependency_index].outputs.push(task_index);
        Ok(())
    }

    /// Attaches opaque user data to a task.
    pub fn set_task_udata(&self, task: TaskId, udata: TaskUdata) -> FlowResult<()> {
        let mut state = self.shared.state.lock();
        let index = self.resolve(&state, task)?;
        state.tasks[index].udata = Some(udata);
        Ok(())
    }

    /// Returns the user data attached to a task, if any.
    pub fn task_udata(&self, task: TaskId) -> FlowResult<Option<TaskUdata>> {
        let state = self.shared.state.lock();
        let index = self.resolve(&state, task)?;
        Ok(state.tasks[index].udata.clone())
    }

    /// Returns the number of tasks in the flow.
    pub fn task_count(&self) -> usize {
        self.shared.state.lock().tasks.len()
    }

    /// Returns the handle of the task at `index` in insertion order, or
    /// `None` when out of range.
    pub fn task_at(&self, index: usize) -> Option<TaskId> {
        let state = self.shared.state.lock();
        (index < state.tasks.len()).then_some(TaskId {
            flow: self.shared.id,
            index,
        })
    }

    /// Returns the handle of the task with the given name.
    pub fn find_task(&self, name: &str) -> Option<TaskId> {
        let state = self.shared.state.lock();
        state.names.get(name).map(|&index| TaskId {
            flow: self.shared.id,
            index,
        })
    }

    /// Returns the name of a task.
    pub fn task_name(&self, task: TaskId) -> FlowResult<Arc<str>> {
        let state = self.shared.state.lock();
        let index = self.resolve(&state, task)?;
        Ok(Arc::clone(&state.tasks[index].name))
    }

    /// Returns the number of dependencies (inputs) of a task.
    pub fn task_input_count(&self, task: TaskId) -> FlowResult<usize> {
        let state = self.shared.state.lock();
        let index = self.resolve(&state, task)?;
        Ok(state.tasks[index].inputs.len())
    }

    /// Returns the dependency of `task` at `position`, or `None` when out
    /// of range.
    pub fn task_input_at(&self, task: TaskId, position: usize) -> FlowResult<Option<TaskId>> {
        let state = self.shared.state.lock();
        let index = self.resolve(&state, task)?;
        Ok(state.tasks[index].inputs.get(position).map(|&input| TaskId {
            flow: self.shared.id,
            index: input,
        }))
    }

    /// Returns the number of dependents (outputs) of a task.
    pub fn task_output_count(&self, task: TaskId) -> FlowResult<usize> {
        let state = self.shared.state.lock();
        let index = self.resolve(&state, task)?;
        Ok(state.tasks[index].outputs.len())
    }

    /// Returns the dependent of `task` at `position`, or `None` when out
    /// of range.
    pub fn task_output_at(&self, task: TaskId, position: usize) -> FlowResult<Option<TaskId>> {
        let state = self.shared.state.lock();
        let index = self.resolve(&state, task)?;
        Ok(state.tasks[index]
            .outputs
            .get(position)
            .map(|&output| TaskId {
                flow: self.shared.id,
                index: output,
            }))
    }

    /// Sets a callback fired when the flow stops because it reached the
    /// cycle target passed to `start`.
    ///
    /// The callback runs on the worker thread that completed the final
    /// sink, after the flow mutex has been released. It is *not* fired
    /// when the flow is stopped explicitly via [`stop`](Self::stop).
    pub fn set_stop_callback(&self, callback: impl Fn(TaskFlowStatus) + Send + Sync + 'static) {
        self.shared.state.lock().stop_callback = Some(Arc::new(callback));
    }

    /// Starts executing cycles.
    ///
    /// Recomputes the source (no inputs) and sink (no outputs) sets,
    /// resets the cycle counters, and schedules every source task. With
    /// `cycles == 0` the flow runs until [`stop`](Self::stop) is called.
    ///
    /// # Errors
    /// - [`FlowError::AlreadyRunning`] if the flow is running.
    /// - [`FlowError::NoTasks`] if no task was added.
    /// - [`FlowError::CyclicDependencies`] if the dependency edges form a
    ///   cycle.
    pub fn start(&self, cycles: u64) -> FlowResult<()> {
        let mut state = self.shared.state.lock();
        if state.running {
            return Err(FlowError::AlreadyRunning);
        }
        if state.tasks.is_empty() {
            return Err(FlowError::NoTasks);
        }

        graph::ensure_acyclic(&state.tasks)?;

        let FlowState {
            tasks,
            sources,
            sinks,
            ..
        } = &mut *state;
        sources.clear();
        sinks.clear();
        for (index, task) in tasks.iter_mut().enumerate() {
            task.completed_cycles = 0;
            if task.inputs.is_empty() {
                sources.push(index);
            }
            if task.outputs.is_empty() {
                sinks.push(index);
            }
        }

        state.cycles_target = cycles;
        state.cycles_run = 0;
        state.running = true;
        state.stop = false;

        if let Err(err) = FlowShared::restart_sources(&self.shared, &mut state) {
            state.running = false;
            return Err(FlowError::Enqueue(err));
        }
        Ok(())
    }

    /// Requests a stop and waits for the flow to reach it.
    ///
    /// The stop is cooperative: the current cycle runs to completion and
    /// no new cycle begins.
    ///
    /// # Errors
    /// - [`FlowError::NotRunning`] if the flow is not running.
    /// - [`FlowError::TimedOut`] if `timeout` elapses first (zero means
    ///   wait indefinitely).
    pub fn stop(&self, timeout: Duration) -> FlowResult<()> {
        {
            let mut state = self.shared.state.lock();
            if !state.running {
                return Err(FlowError::NotRunning);
            }
            state.stop = true;
        }
        self.wait(timeout)
    }

    /// Waits until the flow stops.
    ///
    /// A zero `timeout` waits indefinitely. Returns immediately when the
    /// flow is not running.
    ///
    /// # Errors
    /// [`FlowError::TimedOut`] if `timeout` elapses while the flow is
    /// still running.
    pub fn wait(&self, timeout: Duration) -> FlowResult<()> {
        let timeout = if timeout.is_zero() {
            EFFECTIVELY_INFINITE
        } else {
            timeout
        };
        let deadline = Instant::now() + timeout;

        let mut state = self.shared.state.lock();
        while state.running {
            let result = self.shared.stopped.wait_until(&mut state, deadline);
            if result.timed_out() && state.running {
                return Err(FlowError::TimedOut);
            }
        }
        Ok(())
    }

    /// Returns a consistent snapshot of the execution state.
    pub fn status(&self) -> TaskFlowStatus {
        self.shared.state.lock().status()
    }

    /// Whether the flow is currently executing cycles.
    pub fn is_running(&self) -> bool {
        self.shared.state.lock().running
    }

    fn resolve(&self, state: &FlowState, id: TaskId) -> FlowResult<usize> {
        if id.flow != self.shared.id || id.index >= state.tasks.len() {
            return Err(FlowError::UnknownTask);
        }
        Ok(id.index)
    }
}

impl fmt::Debug for TaskFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskFlow")
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl FlowShared {
    /// Schedules one task execution on the worker pool.
    fn spawn_task(shared: &Arc<Self>, index: usize) -> QueueResult<()> {
        let captured = Arc::clone(shared);
        shared
            .sender
            .run(move || Self::execute_task(&captured, index))
    }

    /// Begins a cycle by scheduling every source task.
    fn restart_sources(shared: &Arc<Self>, state: &mut FlowState) -> QueueResult<()> {
        state.run_sinks = 0;
        for i in 0..state.sources.len() {
            Self::spawn_task(shared, state.sources[i])?;
        }
        Ok(())
    }

    /// The wrapper each worker runs instead of the raw task body: executes
    /// the body (with optional tracing), then advances the flow under the
    /// mutex, scheduling whatever became ready.
    fn execute_task(shared: &Arc<Self>, index: usize) {
        let (func, name) = {
            let state = shared.state.lock();
            let task = &state.tasks[index];
            (Arc::clone(&task.func), Arc::clone(&task.name))
        };

        if let Some(tracer) = &shared.tracer {
            tracer.begin(&name, TASK_CATEGORY);
        }
        conflux_log::with_trace_logging!("Executing task {}", name; (func)());
        if let Some(tracer) = &shared.tracer {
            tracer.end(&name, TASK_CATEGORY);
        }

        let mut state = shared.state.lock();
        state.tasks[index].completed_cycles += 1;

        if state.tasks[index].outputs.is_empty() {
            Self::complete_sink(shared, state);
            return;
        }

        // Schedule each dependent whose inputs have all completed the same
        // cycle. The first input's count serves as the witness value.
        let outputs = state.tasks[index].outputs.clone();
        for dependent_index in outputs {
            let ready = {
                let dependent = &state.tasks[dependent_index];
                debug_assert!(
                    !dependent.inputs.is_empty(),
                    "a task reachable as a dependent must have inputs"
                );
                let witness = state.tasks[dependent.inputs[0]].completed_cycles;
                dependent
                    .inputs
                    .iter()
                    .all(|&input| state.tasks[input].completed_cycles == witness)
            };

            if ready && Self::spawn_task(shared, dependent_index).is_err() {
                // The pool is shutting down; the flow is being torn down
                // with it and nothing more needs scheduling.
                return;
            }
        }
    }

    /// Handles completion of a sink task: ends the cycle once every sink
    /// has run, then stops the flow or begins the next cycle.
    fn complete_sink(shared: &Arc<Self>, mut state: MutexGuard<'_, FlowState>) {
        state.run_sinks += 1;
        if state.run_sinks < state.sinks.len() {
            return;
        }

        // Every sink has run: the cycle is complete.
        state.cycles_run += 1;
        let reached_target = state.cycles_target != 0 && state.cycles_run >= state.cycles_target;

        if state.stop || reached_target {
            state.running = false;
            let status = state.status();
            let callback = if reached_target {
                state.stop_callback.clone()
            } else {
                None
            };
            shared.stopped.notify_all();
            drop(state);

            // User code runs outside the flow mutex.
            if let Some(callback) = callback {
                callback(status);
            }
            return;
        }

        // A failed enqueue means the pool is shutting down; there is
        // nothing left to schedule.
        let _ = Self::restart_sources(shared, &mut state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::atomic::{AtomicBool, AtomicUsize},
        thread,
    };

    fn flow(n_workers: usize) -> TaskFlow {
        TaskFlow::new(NonZeroUsize::new(n_workers).unwrap(), None)
    }

    fn counting_task(count: Arc<AtomicUsize>) -> impl Fn() + Send + Sync + 'static {
        move || {
            count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// A task body that spins until `release` is set, keeping the flow
    /// running for as long as a test needs it to.
    fn gated_task(release: Arc<AtomicBool>) -> impl Fn() + Send + Sync + 'static {
        move || {
            while !release.load(Ordering::Acquire) {
                thread::sleep(Duration::from_millis(1));
            }
        }
    }

    #[test]
    fn adding_tasks_and_looking_them_up_works() {
        let flow = flow(2);
        let t1 = flow.add_task("t1", || {}).unwrap();
        let t2 = flow.add_task("t2", || {}).unwrap();

        assert_eq!(flow.task_count(), 2);
        assert_eq!(flow.task_at(0), Some(t1));
        assert_eq!(flow.task_at(1), Some(t2));
        assert_eq!(flow.task_at(2), None);
        assert_eq!(flow.find_task("t1"), Some(t1));
        assert_eq!(flow.find_task("missing"), None);
        assert_eq!(&*flow.task_name(t2).unwrap(), "t2");
    }

    #[test]
    fn duplicate_task_names_are_rejected() {
        let flow = flow(1);
        flow.add_task("t1", || {}).unwrap();
        assert_eq!(
            flow.add_task("t1", || {}).unwrap_err(),
            FlowError::DuplicateName("t1".to_owned())
        );
    }

    #[test]
    fn empty_task_name_is_rejected() {
        let flow = flow(1);
        assert_eq!(flow.add_task("", || {}).unwrap_err(), FlowError::EmptyName);
    }

    #[test]
    fn dependency_edges_are_validated() {
        let flow = flow(1);
        let other_flow = self::flow(1);

        let a = flow.add_task("a", || {}).unwrap();
        let b = flow.add_task("b", || {}).unwrap();
        let foreign = other_flow.add_task("x", || {}).unwrap();

        flow.add_dependency(b, a).unwrap();
        assert_eq!(
            flow.add_dependency(b, a),
            Err(FlowError::DuplicateDependency)
        );
        assert_eq!(flow.add_dependency(a, a), Err(FlowError::SelfDependency));
        assert_eq!(flow.add_dependency(b, foreign), Err(FlowError::UnknownTask));

        assert_eq!(flow.task_input_count(b).unwrap(), 1);
        assert_eq!(flow.task_input_at(b, 0).unwrap(), Some(a));
        assert_eq!(flow.task_input_at(b, 1).unwrap(), None);
        assert_eq!(flow.task_output_count(a).unwrap(), 1);
        assert_eq!(flow.task_output_at(a, 0).unwrap(), Some(b));
        assert_eq!(flow.task_input_count(a).unwrap(), 0);
    }

    #[test]
    fn starting_with_no_tasks_fails() {
        let flow = flow(1);
        assert_eq!(flow.start(1), Err(FlowError::NoTasks));
    }

    #[test]
    fn cyclic_flows_are_rejected_at_start() {
        let flow = flow(2);
        let a = flow.add_task("a", || {}).unwrap();
        let b = flow.add_task("b", || {}).unwrap();
        flow.add_dependency(b, a).unwrap();
        flow.add_dependency(a, b).unwrap();

        assert_eq!(flow.start(1), Err(FlowError::CyclicDependencies));
        assert!(!flow.is_running());
    }

    #[test]
    fn single_task_runs_requested_cycles() {
        let flow = flow(2);
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        flow.add_task("t1", move || {
            thread::sleep(Duration::from_millis(1));
            counter.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();

        flow.start(5).unwrap();
        flow.wait(Duration::ZERO).unwrap();

        let status = flow.status();
        assert!(!status.running);
        assert_eq!(status.cycles_target, 5);
        assert_eq!(status.cycles_run, 5);
        assert_eq!(count.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn independent_tasks_each_run_every_cycle() {
        let flow = flow(4);
        let counts: Vec<_> = (0..3).map(|_| Arc::new(AtomicUsize::new(0))).collect();

        for (i, count) in counts.iter().enumerate() {
            flow.add_task(&format!("t{i}"), counting_task(Arc::clone(count))).unwrap();
        }

        flow.start(4).unwrap();
        flow.wait(Duration::ZERO).unwrap();

        for count in &counts {
            assert_eq!(count.load(Ordering::Relaxed), 4);
        }
        assert_eq!(flow.status().cycles_run, 4);
    }

    #[test]
    fn diamond_flow_respects_dependency_order() {
        const CYCLES: usize = 3;

        let flow = flow(4);
        let log = Arc::new(Mutex::new(Vec::<&'static str>::new()));

        let recorder = |name: &'static str| {
            let log = Arc::clone(&log);
            move || {
                log.lock().push(name);
            }
        };

        let t1 = flow.add_task("t1", recorder("t1")).unwrap();
        let t2 = flow.add_task("t2", recorder("t2")).unwrap();
        let t3 = flow.add_task("t3", recorder("t3")).unwrap();
        let t4 = flow.add_task("t4", recorder("t4")).unwrap();
        flow.add_dependency(t2, t1).unwrap();
        flow.add_dependency(t3, t1).unwrap();
        flow.add_dependency(t4, t2).unwrap();
        flow.add_dependency(t4, t3).unwrap();

        flow.start(CYCLES as u64).unwrap();
        flow.wait(Duration::ZERO).unwrap();

        let log = log.lock();
        assert_eq!(log.len(), 4 * CYCLES);

        // Cycle boundaries are strict, so every chunk of four entries is
        // one complete cycle.
        for cycle in log.chunks(4) {
            let position =
                |name| cycle.iter().position(|&entry| entry == name).unwrap();
            assert!(position("t1") < position("t2"));
            assert!(position("t1") < position("t3"));
            assert!(position("t2") < position("t4"));
            assert!(position("t3") < position("t4"));
        }
    }

    #[test]
    fn stop_halts_at_a_cycle_boundary() {
        let flow = flow(2);
        let count = Arc::new(AtomicUsize::new(0));
        flow.add_task("t1", counting_task(Arc::clone(&count))).unwrap();

        flow.start(0).unwrap();
        thread::sleep(Duration::from_millis(10));
        flow.stop(Duration::ZERO).unwrap();

        let status = flow.status();
        assert!(!status.running);
        assert!(status.cycles_run > 0);

        let after_stop = count.load(Ordering::Relaxed);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::Relaxed), after_stop);
        assert_eq!(status.cycles_run as usize, after_stop);
    }

    #[test]
    fn stopping_a_stopped_flow_fails() {
        let flow = flow(1);
        flow.add_task("t1", || {}).unwrap();
        assert_eq!(
            flow.stop(Duration::from_millis(10)),
            Err(FlowError::NotRunning)
        );
    }

    #[test]
    fn running_flow_rejects_mutation_and_restart() {
        let flow = flow(2);
        let release = Arc::new(AtomicBool::new(false));
        let gate = flow.add_task("gate", gated_task(Arc::clone(&release))).unwrap();

        flow.start(1).unwrap();
        assert!(flow.is_running());

        assert_eq!(flow.start(1), Err(FlowError::AlreadyRunning));
        assert_eq!(
            flow.add_task("other", || {}).unwrap_err(),
            FlowError::AlreadyRunning
        );
        assert_eq!(
            flow.add_dependency(gate, gate),
            Err(FlowError::AlreadyRunning)
        );

        release.store(true, Ordering::Release);
        flow.wait(Duration::ZERO).unwrap();
        assert!(!flow.is_running());
    }

    #[test]
    fn wait_times_out_while_flow_is_running() {
        let flow = flow(2);
        let release = Arc::new(AtomicBool::new(false));
        flow.add_task("gate", gated_task(Arc::clone(&release))).unwrap();

        flow.start(1).unwrap();
        assert_eq!(
            flow.wait(Duration::from_millis(5)),
            Err(FlowError::TimedOut)
        );

        release.store(true, Ordering::Release);
        flow.wait(Duration::ZERO).unwrap();
    }

    #[test]
    fn stop_callback_fires_only_when_cycle_target_is_reached() {
        let flow = flow(2);
        let fired = Arc::new(AtomicUsize::new(0));
        {
            let fired = Arc::clone(&fired);
            flow.set_stop_callback(move |status| {
                assert!(!status.running);
                assert_eq!(status.cycles_run, status.cycles_target);
                fired.fetch_add(1, Ordering::Relaxed);
            });
        }
        flow.add_task("t1", || {}).unwrap();

        // Ending by cycle target fires the callback once.
        flow.start(2).unwrap();
        flow.wait(Duration::ZERO).unwrap();
        assert_eq!(fired.load(Ordering::Relaxed), 1);

        // An explicit stop does not.
        flow.start(0).unwrap();
        thread::sleep(Duration::from_millis(5));
        flow.stop(Duration::ZERO).unwrap();
        assert_eq!(fired.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn flow_restarts_cleanly_after_completion() {
        let flow = flow(2);
        let count = Arc::new(AtomicUsize::new(0));
        flow.add_task("t1", counting_task(Arc::clone(&count))).unwrap();

        flow.start(2).unwrap();
        flow.wait(Duration::ZERO).unwrap();
        flow.start(3).unwrap();
        flow.wait(Duration::ZERO).unwrap();

        assert_eq!(count.load(Ordering::Relaxed), 5);
        let status = flow.status();
        assert_eq!(status.cycles_target, 3);
        assert_eq!(status.cycles_run, 3);
    }

    #[test]
    fn tracer_records_begin_end_pairs_for_each_task() {
        let tracer = Arc::new(Tracer::new(64));
        let flow = TaskFlow::new(NonZeroUsize::new(2).unwrap(), Some(Arc::clone(&tracer)));
        flow.add_task("traced", || {}).unwrap();

        flow.start(3).unwrap();
        flow.wait(Duration::ZERO).unwrap();

        assert!(flow.tracer().is_some());
        assert_eq!(tracer.count(), 6);

        let mut buffer = Vec::new();
        tracer.json_write(&mut buffer).unwrap();
        let events: serde_json::Value = serde_json::from_slice(&buffer).unwrap();
        let events = events.as_array().unwrap();
        assert_eq!(events.len(), 6);
        for (index, event) in events.iter().enumerate() {
            assert_eq!(event["name"], "traced");
            assert_eq!(event["cat"], "task");
            let expected_phase = if index % 2 == 0 { "B" } else { "E" };
            assert_eq!(event["ph"], expected_phase);
        }
    }

    #[test]
    fn task_udata_round_trip_works() {
        let flow = flow(1);
        let task = flow.add_task("t1", || {}).unwrap();

        assert!(flow.task_udata(task).unwrap().is_none());

        flow.set_task_udata(task, Arc::new(42_i32)).unwrap();
        let udata = flow.task_udata(task).unwrap().unwrap();
        assert_eq!(udata.downcast_ref::<i32>(), Some(&42));
    }

    #[test]
    fn foreign_handles_are_rejected_by_introspection() {
        let flow = flow(1);
        let other_flow = self::flow(1);
        let foreign = other_flow.add_task("x", || {}).unwrap();

        assert_eq!(flow.task_name(foreign), Err(FlowError::UnknownTask));
        assert!(matches!(
            flow.task_udata(foreign),
            Err(FlowError::UnknownTask)
        ));
        assert_eq!(flow.task_input_count(foreign), Err(FlowError::UnknownTask));
    }
}
