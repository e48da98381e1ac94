use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use serde::{Serialize, Serializer};
use tracing::{debug, error, info, warn};

use crate::convert::FormatConvert;
use crate::domain::{ArtifactKind, CoordinateFormat, Stage, Uid};
use crate::error::BeaconError;
use crate::records::{ModelRecord, RecordStore};
use crate::remote::CancelToken;
use crate::scoring::{QualityScore, ScoreDocument, ScoreSummary};
use crate::store::{self, Workspace};
use crate::uid;

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

/// Receives pipeline progress. Shared by every worker thread.
pub trait ProgressSink: Sync {
    fn event(&self, event: ProgressEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskId {
    Ingest,
    QualityScore,
    ConvertMmcif,
    ConvertBcif,
}

impl TaskId {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskId::Ingest => "ingest",
            TaskId::QualityScore => "quality_score",
            TaskId::ConvertMmcif => "convert_mmcif",
            TaskId::ConvertBcif => "convert_bcif",
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Running,
    Done,
    Failed,
    /// An upstream task did not finish, so this one never started.
    Blocked,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Done | TaskState::Failed | TaskState::Blocked)
    }
}

/// Record fields a task commits together with its stage timestamp.
#[derive(Default)]
pub struct RecordPatch(Option<Box<dyn Fn(&mut ModelRecord) + Send + Sync>>);

impl RecordPatch {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn new(apply: impl Fn(&mut ModelRecord) + Send + Sync + 'static) -> Self {
        Self(Some(Box::new(apply)))
    }

    pub fn apply(&self, record: &mut ModelRecord) {
        if let Some(apply) = &self.0 {
            apply(record);
        }
    }
}

pub struct TaskContext<'a> {
    pub uid: &'a Uid,
    pub source: &'a Utf8Path,
    pub workspace: &'a Workspace,
    pub cancel: &'a CancelToken,
}

impl TaskContext<'_> {
    pub fn artifact(&self, kind: ArtifactKind) -> Utf8PathBuf {
        self.workspace.artifact_path(self.uid, kind)
    }
}

/// One node of the per-model graph. The engine owns the skip rule and the
/// stage commit; a task only produces its artifact at `output`.
pub trait Task: Send + Sync {
    fn id(&self) -> TaskId;

    fn requires(&self) -> &[TaskId];

    fn output(&self) -> ArtifactKind;

    /// Stage timestamp set when this task completes, if any.
    fn stage(&self) -> Option<Stage>;

    fn run(&self, ctx: &TaskContext<'_>, output: &Utf8Path) -> Result<RecordPatch, BeaconError>;

    /// Rebuilds the record fields from an artifact that was published but
    /// never committed.
    fn reconcile(
        &self,
        _ctx: &TaskContext<'_>,
        _output: &Utf8Path,
    ) -> Result<RecordPatch, BeaconError> {
        Ok(RecordPatch::none())
    }
}

pub struct IngestTask;

impl Task for IngestTask {
    fn id(&self) -> TaskId {
        TaskId::Ingest
    }

    fn requires(&self) -> &[TaskId] {
        &[]
    }

    fn output(&self) -> ArtifactKind {
        ArtifactKind::Pdb
    }

    fn stage(&self) -> Option<Stage> {
        Some(Stage::Pdb)
    }

    fn run(&self, ctx: &TaskContext<'_>, output: &Utf8Path) -> Result<RecordPatch, BeaconError> {
        info!(uid = %ctx.uid, source = %ctx.source, "ingesting model");
        store::copy_file_atomic(ctx.source, output)?;
        Ok(RecordPatch::none())
    }
}

pub struct ScoreTask {
    scorer: Arc<dyn QualityScore>,
}

impl ScoreTask {
    pub fn new(scorer: Arc<dyn QualityScore>) -> Self {
        Self { scorer }
    }
}

fn summary_patch(summary: ScoreSummary) -> RecordPatch {
    RecordPatch::new(move |record| {
        record.qmean_version = summary.qmean_version.clone();
        record.qmean_avg_local_score = summary.avg_local_score;
    })
}

impl Task for ScoreTask {
    fn id(&self) -> TaskId {
        TaskId::QualityScore
    }

    fn requires(&self) -> &[TaskId] {
        &[TaskId::Ingest]
    }

    fn output(&self) -> ArtifactKind {
        ArtifactKind::QmeanJson
    }

    fn stage(&self) -> Option<Stage> {
        Some(Stage::Qmean)
    }

    fn run(&self, ctx: &TaskContext<'_>, output: &Utf8Path) -> Result<RecordPatch, BeaconError> {
        let input = ctx.artifact(ArtifactKind::Pdb);
        let document = self.scorer.score(input.as_std_path(), ctx.cancel)?;
        store::write_json_atomic(output, document.as_value())?;
        Ok(summary_patch(document.summary()))
    }

    fn reconcile(
        &self,
        _ctx: &TaskContext<'_>,
        output: &Utf8Path,
    ) -> Result<RecordPatch, BeaconError> {
        let content = fs::read_to_string(output.as_std_path())
            .map_err(|err| BeaconError::Filesystem(format!("read {output}: {err}")))?;
        let document = ScoreDocument::parse(&content)?;
        Ok(summary_patch(document.summary()))
    }
}

pub struct ConvertTask {
    converter: Arc<dyn FormatConvert>,
    target: CoordinateFormat,
}

impl ConvertTask {
    pub fn new(converter: Arc<dyn FormatConvert>, target: CoordinateFormat) -> Self {
        Self { converter, target }
    }

    fn input(&self) -> ArtifactKind {
        match self.target {
            CoordinateFormat::Mmcif => ArtifactKind::Pdb,
            CoordinateFormat::Bcif => ArtifactKind::Mmcif,
        }
    }
}

impl Task for ConvertTask {
    fn id(&self) -> TaskId {
        match self.target {
            CoordinateFormat::Mmcif => TaskId::ConvertMmcif,
            CoordinateFormat::Bcif => TaskId::ConvertBcif,
        }
    }

    fn requires(&self) -> &[TaskId] {
        match self.target {
            CoordinateFormat::Mmcif => &[TaskId::Ingest],
            CoordinateFormat::Bcif => &[TaskId::ConvertMmcif],
        }
    }

    fn output(&self) -> ArtifactKind {
        self.target.artifact()
    }

    fn stage(&self) -> Option<Stage> {
        match self.target {
            CoordinateFormat::Mmcif => Some(Stage::Mmcif),
            CoordinateFormat::Bcif => None,
        }
    }

    fn run(&self, ctx: &TaskContext<'_>, output: &Utf8Path) -> Result<RecordPatch, BeaconError> {
        let input = ctx.artifact(self.input());
        self.converter.convert(&input, output, self.target)?;
        Ok(RecordPatch::none())
    }
}

/// Validated DAG of tasks, kept in topological order.
pub struct TaskGraph {
    tasks: Vec<Box<dyn Task>>,
    deps: Vec<Vec<usize>>,
    order: Vec<usize>,
}

impl TaskGraph {
    pub fn new(tasks: Vec<Box<dyn Task>>) -> Result<Self, BeaconError> {
        let mut index = HashMap::new();
        for (position, task) in tasks.iter().enumerate() {
            if index.insert(task.id(), position).is_some() {
                return Err(BeaconError::InvalidGraph(format!(
                    "task {} is registered twice",
                    task.id()
                )));
            }
        }

        let mut deps = Vec::with_capacity(tasks.len());
        for task in &tasks {
            let mut task_deps = Vec::new();
            for dep in task.requires() {
                let position = index.get(dep).copied().ok_or_else(|| {
                    BeaconError::InvalidGraph(format!("{} requires unknown task {dep}", task.id()))
                })?;
                task_deps.push(position);
            }
            deps.push(task_deps);
        }

        let mut indegree: Vec<usize> = deps.iter().map(Vec::len).collect();
        let mut dependents = vec![Vec::<usize>::new(); tasks.len()];
        for (position, task_deps) in deps.iter().enumerate() {
            for &dep in task_deps {
                dependents[dep].push(position);
            }
        }
        let mut ready: VecDeque<usize> = (0..tasks.len())
            .filter(|&position| indegree[position] == 0)
            .collect();
        let mut order = Vec::with_capacity(tasks.len());
        while let Some(position) = ready.pop_front() {
            order.push(position);
            for &next in &dependents[position] {
                indegree[next] -= 1;
                if indegree[next] == 0 {
                    ready.push_back(next);
                }
            }
        }
        if order.len() != tasks.len() {
            let stuck: Vec<String> = (0..tasks.len())
                .filter(|position| !order.contains(position))
                .map(|position| tasks[position].id().to_string())
                .collect();
            return Err(BeaconError::InvalidGraph(format!(
                "dependency cycle between {}",
                stuck.join(", ")
            )));
        }

        Ok(Self { tasks, deps, order })
    }

    /// `Ingest -> {QualityScore, ConvertMmcif -> ConvertBcif}`.
    pub fn standard(
        scorer: Arc<dyn QualityScore>,
        converter: Arc<dyn FormatConvert>,
    ) -> Result<Self, BeaconError> {
        Self::new(vec![
            Box::new(IngestTask),
            Box::new(ScoreTask::new(scorer)),
            Box::new(ConvertTask::new(converter.clone(), CoordinateFormat::Mmcif)),
            Box::new(ConvertTask::new(converter, CoordinateFormat::Bcif)),
        ])
    }

    pub fn task_ids(&self) -> Vec<TaskId> {
        self.order
            .iter()
            .map(|&position| self.tasks[position].id())
            .collect()
    }
}

#[derive(Debug, Serialize)]
pub struct TaskOutcome {
    pub task: TaskId,
    pub state: TaskState,
    /// The artifact was already present and the run step was skipped.
    pub cached: bool,
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_error"
    )]
    pub error: Option<BeaconError>,
}

fn serialize_error<S: Serializer>(
    error: &Option<BeaconError>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match error {
        Some(err) => serializer.serialize_some(&err.to_string()),
        None => serializer.serialize_none(),
    }
}

#[derive(Debug, Serialize)]
pub struct ModelReport {
    pub uid: Uid,
    pub source: String,
    pub outcomes: Vec<TaskOutcome>,
}

impl ModelReport {
    pub fn is_success(&self) -> bool {
        self.outcomes
            .iter()
            .all(|outcome| outcome.state == TaskState::Done)
    }

    pub fn outcome(&self, task: TaskId) -> Option<&TaskOutcome> {
        self.outcomes.iter().find(|outcome| outcome.task == task)
    }

    /// Moves the first task error out of the report.
    pub fn into_result(mut self) -> Result<Self, BeaconError> {
        match self
            .outcomes
            .iter_mut()
            .find_map(|outcome| outcome.error.take())
        {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub source: Utf8PathBuf,
    /// Caller-supplied uid; the content hash is used otherwise.
    pub uid: Option<Uid>,
}

impl ModelRequest {
    pub fn new(source: Utf8PathBuf) -> Self {
        Self { source, uid: None }
    }

    pub fn with_uid(mut self, uid: Uid) -> Self {
        self.uid = Some(uid);
        self
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Per-model task states, shared by the task threads of one graph run.
struct Board {
    states: Mutex<Vec<TaskState>>,
    changed: Condvar,
}

impl Board {
    fn new(len: usize) -> Self {
        Self {
            states: Mutex::new(vec![TaskState::Pending; len]),
            changed: Condvar::new(),
        }
    }

    /// Blocks until every dependency is terminal, then moves `position` to
    /// `Running` or `Blocked`.
    fn claim(&self, position: usize, deps: &[usize]) -> TaskState {
        let mut states = lock(&self.states);
        while deps.iter().any(|&dep| !states[dep].is_terminal()) {
            states = self
                .changed
                .wait(states)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        let next = if deps.iter().all(|&dep| states[dep] == TaskState::Done) {
            TaskState::Running
        } else {
            TaskState::Blocked
        };
        states[position] = next;
        if next == TaskState::Blocked {
            self.changed.notify_all();
        }
        next
    }

    fn finish(&self, position: usize, state: TaskState) {
        lock(&self.states)[position] = state;
        self.changed.notify_all();
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Runs the task graph for each model, skipping tasks whose artifact is
/// already present and committing stage timestamps as tasks finish.
pub struct Pipeline {
    workspace: Workspace,
    records: Arc<dyn RecordStore>,
    graph: TaskGraph,
    cancel: CancelToken,
}

impl Pipeline {
    pub fn new(workspace: Workspace, records: Arc<dyn RecordStore>, graph: TaskGraph) -> Self {
        Self {
            workspace,
            records,
            graph,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Errors here are limited to resolving the model; task failures are
    /// reported in the returned [`ModelReport`].
    pub fn process(
        &self,
        request: &ModelRequest,
        sink: &dyn ProgressSink,
    ) -> Result<ModelReport, BeaconError> {
        let started = Instant::now();
        let uid = match &request.uid {
            Some(uid) => {
                info!(uid = %uid, source = %request.source, "using caller-supplied uid");
                uid.clone()
            }
            None => uid::uid_from_file(request.source.as_std_path())?,
        };
        sink.event(ProgressEvent {
            message: format!("phase=Resolve; {} -> {uid}", request.source),
            elapsed: None,
        });

        let original_path = fs::canonicalize(request.source.as_std_path())
            .map_err(|err| BeaconError::Filesystem(format!("resolve {}: {err}", request.source)))?;

        self.workspace.ensure_work_dir()?;
        self.records
            .get_or_create(&uid, &original_path.display().to_string())?;

        let ctx = TaskContext {
            uid: &uid,
            source: &request.source,
            workspace: &self.workspace,
            cancel: &self.cancel,
        };
        let outcomes = self.run_graph(&ctx, sink);
        let report = ModelReport {
            uid: uid.clone(),
            source: request.source.to_string(),
            outcomes,
        };

        if report.is_success() {
            info!(uid = %uid, "model complete");
        } else {
            let incomplete: Vec<String> = report
                .outcomes
                .iter()
                .filter(|outcome| outcome.state != TaskState::Done)
                .map(|outcome| format!("{}={:?}", outcome.task, outcome.state))
                .collect();
            warn!(uid = %uid, tasks = %incomplete.join(","), "model partially complete");
        }
        sink.event(ProgressEvent {
            message: format!("phase=Done; {uid}"),
            elapsed: Some(started.elapsed()),
        });
        Ok(report)
    }

    /// Processes independent models on at most `workers` threads. Results
    /// keep the order of `requests`.
    pub fn process_batch(
        &self,
        requests: &[ModelRequest],
        workers: usize,
        sink: &dyn ProgressSink,
    ) -> Vec<Result<ModelReport, BeaconError>> {
        let workers = workers.clamp(1, requests.len().max(1));
        let next = AtomicUsize::new(0);
        let results: Mutex<Vec<Option<Result<ModelReport, BeaconError>>>> =
            Mutex::new(requests.iter().map(|_| None).collect());

        thread::scope(|scope| {
            for worker in 0..workers {
                let (next, results) = (&next, &results);
                scope.spawn(move || {
                    loop {
                        let position = next.fetch_add(1, Ordering::SeqCst);
                        let Some(request) = requests.get(position) else {
                            break;
                        };
                        debug!(worker, source = %request.source, "worker picked up model");
                        let result = self.process(request, sink);
                        if let Err(err) = &result {
                            error!(source = %request.source, "model failed: {err}");
                        }
                        lock(results)[position] = Some(result);
                    }
                });
            }
        });

        results
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .into_iter()
            .flatten()
            .collect()
    }

    fn run_graph(&self, ctx: &TaskContext<'_>, sink: &dyn ProgressSink) -> Vec<TaskOutcome> {
        let board = Board::new(self.graph.tasks.len());
        thread::scope(|scope| {
            let handles: Vec<_> = self
                .graph
                .order
                .iter()
                .map(|&position| {
                    let board = &board;
                    scope.spawn(move || self.run_node(position, ctx, board, sink))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| match handle.join() {
                    Ok(outcome) => outcome,
                    Err(panic) => std::panic::resume_unwind(panic),
                })
                .collect()
        })
    }

    fn run_node(
        &self,
        position: usize,
        ctx: &TaskContext<'_>,
        board: &Board,
        sink: &dyn ProgressSink,
    ) -> TaskOutcome {
        let task = self.graph.tasks[position].as_ref();
        if board.claim(position, &self.graph.deps[position]) == TaskState::Blocked {
            warn!(uid = %ctx.uid, task = %task.id(), "upstream task did not complete, not starting");
            return TaskOutcome {
                task: task.id(),
                state: TaskState::Blocked,
                cached: false,
                error: None,
            };
        }

        let started = Instant::now();
        // A panicking task still has to release its dependents.
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.execute(task, ctx)))
            .unwrap_or_else(|payload| {
                Err(BeaconError::TaskPanicked {
                    task: task.id().to_string(),
                    message: panic_message(payload.as_ref()),
                })
            });
        let (state, cached, error) = match result {
            Ok(cached) => (TaskState::Done, cached, None),
            Err(err) => {
                error!(uid = %ctx.uid, task = %task.id(), "task failed: {err}");
                (TaskState::Failed, false, Some(err))
            }
        };
        board.finish(position, state);
        sink.event(ProgressEvent {
            message: format!("phase=Task; {} {} {:?}", ctx.uid, task.id(), state),
            elapsed: Some(started.elapsed()),
        });
        TaskOutcome {
            task: task.id(),
            state,
            cached,
            error,
        }
    }

    /// Returns whether the run step was skipped.
    fn execute(&self, task: &dyn Task, ctx: &TaskContext<'_>) -> Result<bool, BeaconError> {
        let output = self.workspace.ensure_artifact_path(ctx.uid, task.output())?;

        let (patch, cached) = if store::artifact_present(&output) {
            debug!(uid = %ctx.uid, task = %task.id(), path = %output, "output present, skipping run");
            let Some(stage) = task.stage() else {
                return Ok(true);
            };
            let committed = self
                .records
                .get(ctx.uid)?
                .and_then(|record| record.stage_completed_at(stage))
                .is_some();
            if committed {
                return Ok(true);
            }
            warn!(uid = %ctx.uid, stage = %stage, "artifact present without stage timestamp, back-filling");
            (task.reconcile(ctx, &output)?, true)
        } else {
            if ctx.cancel.is_cancelled() {
                return Err(BeaconError::Cancelled(format!("{} for {}", task.id(), ctx.uid)));
            }
            info!(uid = %ctx.uid, task = %task.id(), "running task");
            (task.run(ctx, &output)?, false)
        };

        if let Some(stage) = task.stage() {
            self.records
                .commit_stage(ctx.uid, stage, Utc::now(), &|record| patch.apply(record))?;
        }
        Ok(cached)
    }
}
