use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};

use beacon_pipeline::convert::FormatConvert;
use beacon_pipeline::domain::{ArtifactKind, CoordinateFormat, Uid};
use beacon_pipeline::error::BeaconError;
use beacon_pipeline::output::JsonOutput;
use beacon_pipeline::pipeline::{ModelRequest, Pipeline, TaskGraph, TaskId, TaskState};
use beacon_pipeline::records::{JsonRecordStore, RecordStore};
use beacon_pipeline::remote::CancelToken;
use beacon_pipeline::scoring::{QualityScore, ScoreDocument};
use beacon_pipeline::store::{self, Workspace};
use beacon_pipeline::uid::derive_uid;

const FIXTURE_PDB: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/PF05017.pdb");
const FIXTURE_QMEAN: &str = concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/tests/fixtures/PF05017_qmean.json"
);

#[derive(Default)]
struct MockScorer {
    calls: Mutex<usize>,
    fail: bool,
}

impl QualityScore for MockScorer {
    fn score(&self, structure: &Path, _cancel: &CancelToken) -> Result<ScoreDocument, BeaconError> {
        *self.calls.lock().unwrap() += 1;
        assert!(structure.exists());
        if self.fail {
            return Err(BeaconError::UnknownJobStatus {
                status: "WEIRD".to_string(),
                job: "https://qmean.example/results/1.json".to_string(),
            });
        }
        ScoreDocument::parse(&fs::read_to_string(FIXTURE_QMEAN).unwrap())
    }
}

#[derive(Default)]
struct MockConverter {
    calls: Mutex<Vec<CoordinateFormat>>,
    fail_on: Option<CoordinateFormat>,
}

impl MockConverter {
    fn failing(format: CoordinateFormat) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_on: Some(format),
        }
    }

    fn calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl FormatConvert for MockConverter {
    fn convert(
        &self,
        input: &Utf8Path,
        output: &Utf8Path,
        target: CoordinateFormat,
    ) -> Result<(), BeaconError> {
        self.calls.lock().unwrap().push(target);
        if self.fail_on == Some(target) {
            return Err(BeaconError::Conversion {
                command: format!("gemmi convert --to {target} {input} {output}"),
                stdout: String::new(),
                stderr: "boom".to_string(),
                code: Some(1),
            });
        }
        let content = fs::read(input.as_std_path()).unwrap();
        let mut converted = format!("data_{target}\n").into_bytes();
        converted.extend_from_slice(&content);
        store::write_bytes_atomic(output, &converted)
    }
}

struct PanickingConverter;

impl FormatConvert for PanickingConverter {
    fn convert(
        &self,
        _input: &Utf8Path,
        _output: &Utf8Path,
        _target: CoordinateFormat,
    ) -> Result<(), BeaconError> {
        panic!("converter crashed");
    }
}

struct Harness {
    _temp: tempfile::TempDir,
    root: Utf8PathBuf,
    workspace: Workspace,
    records: Arc<JsonRecordStore>,
    scorer: Arc<MockScorer>,
    converter: Arc<MockConverter>,
}

impl Harness {
    fn new(scorer: MockScorer, converter: MockConverter) -> Self {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let workspace = Workspace::new(root.join("work"));
        let records = Arc::new(JsonRecordStore::open(root.join("records")).unwrap());
        Self {
            _temp: temp,
            root,
            workspace,
            records,
            scorer: Arc::new(scorer),
            converter: Arc::new(converter),
        }
    }

    fn pipeline(&self) -> Pipeline {
        let graph = TaskGraph::standard(self.scorer.clone(), self.converter.clone()).unwrap();
        Pipeline::new(self.workspace.clone(), self.records.clone(), graph)
    }

    fn input(&self, name: &str) -> Utf8PathBuf {
        let path = self.root.join(name);
        fs::copy(FIXTURE_PDB, path.as_std_path()).unwrap();
        path
    }

    fn score_calls(&self) -> usize {
        *self.scorer.calls.lock().unwrap()
    }
}

fn canonical(path: &Utf8Path) -> String {
    fs::canonicalize(path.as_std_path())
        .unwrap()
        .display()
        .to_string()
}

fn fixture_uid() -> Uid {
    derive_uid(&fs::read(FIXTURE_PDB).unwrap())
}

#[test]
fn end_to_end_pipeline_produces_artifacts_and_record() {
    let harness = Harness::new(MockScorer::default(), MockConverter::default());
    let source = harness.input("PF05017.pdb");

    let report = harness
        .pipeline()
        .process(&ModelRequest::new(source.clone()), &JsonOutput)
        .unwrap();
    assert!(report.is_success(), "{report:?}");

    let uid = fixture_uid();
    assert_eq!(report.uid, uid);
    let pdb = harness.workspace.artifact_path(&uid, ArtifactKind::Pdb);
    assert!(pdb.ends_with(format!("{}/{uid}.pdb", &uid.as_str()[..2])));
    assert_eq!(
        fs::read(pdb.as_std_path()).unwrap(),
        fs::read(FIXTURE_PDB).unwrap()
    );
    for kind in [ArtifactKind::Mmcif, ArtifactKind::Bcif, ArtifactKind::QmeanJson] {
        assert!(store::artifact_present(&harness.workspace.artifact_path(&uid, kind)));
    }

    let record = harness.records.get(&uid).unwrap().unwrap();
    assert_eq!(record.original_path, canonical(&source));
    assert!(record.pdb_created_at.is_some());
    assert!(record.mmcif_created_at.is_some());
    assert!(record.qmean_created_at.is_some());
    assert!(record.model_data_created_at.is_none());
    assert_eq!(record.qmean_avg_local_score, Some(0.6351));
    assert_eq!(record.qmean_version.as_deref(), Some("4.2.0"));
}

#[test]
fn rerun_skips_completed_tasks() {
    let harness = Harness::new(MockScorer::default(), MockConverter::default());
    let source = harness.input("PF05017.pdb");
    let pipeline = harness.pipeline();
    let request = ModelRequest::new(source);

    pipeline.process(&request, &JsonOutput).unwrap();
    let uid = fixture_uid();
    let first = harness.records.get(&uid).unwrap().unwrap();

    let report = pipeline.process(&request, &JsonOutput).unwrap();
    assert!(report.is_success());
    assert!(report.outcomes.iter().all(|outcome| outcome.cached));
    assert_eq!(harness.score_calls(), 1);
    assert_eq!(harness.converter.calls(), 2);

    let second = harness.records.get(&uid).unwrap().unwrap();
    assert_eq!(second.pdb_created_at, first.pdb_created_at);
    assert_eq!(second.mmcif_created_at, first.mmcif_created_at);
    assert_eq!(second.qmean_created_at, first.qmean_created_at);
}

#[test]
fn conversion_failure_does_not_block_scoring() {
    let harness = Harness::new(
        MockScorer::default(),
        MockConverter::failing(CoordinateFormat::Mmcif),
    );
    let source = harness.input("PF05017.pdb");

    let report = harness
        .pipeline()
        .process(&ModelRequest::new(source), &JsonOutput)
        .unwrap();
    assert!(!report.is_success());
    assert_eq!(report.outcome(TaskId::Ingest).unwrap().state, TaskState::Done);
    assert_eq!(report.outcome(TaskId::QualityScore).unwrap().state, TaskState::Done);
    assert_eq!(report.outcome(TaskId::ConvertMmcif).unwrap().state, TaskState::Failed);
    assert_eq!(report.outcome(TaskId::ConvertBcif).unwrap().state, TaskState::Blocked);

    let uid = fixture_uid();
    let record = harness.records.get(&uid).unwrap().unwrap();
    assert!(record.qmean_created_at.is_some());
    assert!(record.mmcif_created_at.is_none());
    assert!(!harness.workspace.artifact_path(&uid, ArtifactKind::Mmcif).as_std_path().exists());

    assert_matches!(report.into_result(), Err(BeaconError::Conversion { .. }));
}

#[test]
fn scoring_failure_does_not_block_conversion() {
    let scorer = MockScorer {
        calls: Mutex::new(0),
        fail: true,
    };
    let harness = Harness::new(scorer, MockConverter::default());
    let source = harness.input("PF05017.pdb");

    let report = harness
        .pipeline()
        .process(&ModelRequest::new(source), &JsonOutput)
        .unwrap();
    assert_eq!(report.outcome(TaskId::QualityScore).unwrap().state, TaskState::Failed);
    assert_eq!(report.outcome(TaskId::ConvertBcif).unwrap().state, TaskState::Done);

    let record = harness.records.get(&fixture_uid()).unwrap().unwrap();
    assert!(record.mmcif_created_at.is_some());
    assert!(record.qmean_created_at.is_none());
    assert!(record.qmean_avg_local_score.is_none());
    assert_matches!(report.into_result(), Err(BeaconError::UnknownJobStatus { status, .. }) if status == "WEIRD");
}

#[test]
fn reingest_keeps_one_record_with_latest_path() {
    let harness = Harness::new(MockScorer::default(), MockConverter::default());
    let pipeline = harness.pipeline();
    let first = harness.input("first.pdb");
    let second = harness.input("second.pdb");

    pipeline.process(&ModelRequest::new(first), &JsonOutput).unwrap();
    pipeline
        .process(&ModelRequest::new(second.clone()), &JsonOutput)
        .unwrap();

    let records = harness.records.list().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].original_path, canonical(&second));
}

#[test]
fn ingest_does_not_overwrite_existing_artifact() {
    let harness = Harness::new(MockScorer::default(), MockConverter::default());
    let source = harness.input("PF05017.pdb");
    let pipeline = harness.pipeline();
    pipeline
        .process(&ModelRequest::new(source.clone()), &JsonOutput)
        .unwrap();

    let uid = fixture_uid();
    let pdb = harness.workspace.artifact_path(&uid, ArtifactKind::Pdb);
    let before = fs::metadata(pdb.as_std_path()).unwrap().modified().unwrap();
    let stamped = harness.records.get(&uid).unwrap().unwrap().pdb_created_at;

    let report = pipeline.process(&ModelRequest::new(source), &JsonOutput).unwrap();
    assert!(report.outcome(TaskId::Ingest).unwrap().cached);
    let after = fs::metadata(pdb.as_std_path()).unwrap().modified().unwrap();
    assert_eq!(before, after);
    assert_eq!(
        harness.records.get(&uid).unwrap().unwrap().pdb_created_at,
        stamped
    );
}

#[test]
fn backfills_stage_for_published_but_uncommitted_artifact() {
    let harness = Harness::new(MockScorer::default(), MockConverter::default());
    let source = harness.input("PF05017.pdb");
    let uid = fixture_uid();

    let qmean = harness
        .workspace
        .ensure_artifact_path(&uid, ArtifactKind::QmeanJson)
        .unwrap();
    fs::copy(FIXTURE_QMEAN, qmean.as_std_path()).unwrap();

    let report = harness
        .pipeline()
        .process(&ModelRequest::new(source), &JsonOutput)
        .unwrap();
    assert!(report.is_success());
    assert!(report.outcome(TaskId::QualityScore).unwrap().cached);
    assert_eq!(harness.score_calls(), 0);

    let record = harness.records.get(&uid).unwrap().unwrap();
    assert!(record.qmean_created_at.is_some());
    assert_eq!(record.qmean_avg_local_score, Some(0.6351));
}

#[test]
fn batch_processes_every_model() {
    let harness = Harness::new(MockScorer::default(), MockConverter::default());
    let requests: Vec<ModelRequest> = (0..4)
        .map(|index| {
            let path = harness.root.join(format!("model_{index}.pdb"));
            let mut content = fs::read(FIXTURE_PDB).unwrap();
            content.extend_from_slice(format!("REMARK 999 variant {index}\n").as_bytes());
            fs::write(path.as_std_path(), content).unwrap();
            ModelRequest::new(path)
        })
        .collect();

    let results = harness.pipeline().process_batch(&requests, 2, &JsonOutput);
    assert_eq!(results.len(), 4);
    for (request, result) in requests.iter().zip(&results) {
        let report = result.as_ref().unwrap();
        assert!(report.is_success());
        assert_eq!(report.source, request.source.as_str());
    }
    assert_eq!(harness.records.list().unwrap().len(), 4);
    assert_eq!(harness.score_calls(), 4);
}

#[test]
fn missing_input_fails_before_any_task() {
    let harness = Harness::new(MockScorer::default(), MockConverter::default());
    let missing = harness.root.join("absent.pdb");
    let err = harness
        .pipeline()
        .process(&ModelRequest::new(missing), &JsonOutput)
        .unwrap_err();
    assert_matches!(err, BeaconError::Filesystem(_));
    assert!(harness.records.list().unwrap().is_empty());
}

#[test]
fn caller_supplied_uid_keys_artifacts() {
    let harness = Harness::new(MockScorer::default(), MockConverter::default());
    let source = harness.input("PF05017.pdb");
    let uid: Uid = "AB".repeat(32).parse().unwrap();

    let report = harness
        .pipeline()
        .process(&ModelRequest::new(source).with_uid(uid.clone()), &JsonOutput)
        .unwrap();
    assert_eq!(report.uid.as_str(), "ab".repeat(32));
    assert!(store::artifact_present(
        &harness.workspace.artifact_path(&uid, ArtifactKind::Pdb)
    ));
    assert!(harness.records.get(&fixture_uid()).unwrap().is_none());
}

#[test]
fn cancelled_pipeline_runs_nothing() {
    let harness = Harness::new(MockScorer::default(), MockConverter::default());
    let source = harness.input("PF05017.pdb");
    let cancel = CancelToken::new();
    cancel.cancel();

    let report = harness
        .pipeline()
        .with_cancel(cancel)
        .process(&ModelRequest::new(source), &JsonOutput)
        .unwrap();
    assert_eq!(report.outcome(TaskId::Ingest).unwrap().state, TaskState::Failed);
    assert_eq!(report.outcome(TaskId::QualityScore).unwrap().state, TaskState::Blocked);
    assert_eq!(harness.score_calls(), 0);
    assert_matches!(report.into_result(), Err(BeaconError::Cancelled(_)));
}

#[test]
fn record_keeps_resolved_source_path() {
    let harness = Harness::new(MockScorer::default(), MockConverter::default());
    harness.input("PF05017.pdb");
    fs::create_dir(harness.root.join("nested").as_std_path()).unwrap();
    let indirect = harness.root.join("nested/../PF05017.pdb");

    let report = harness
        .pipeline()
        .process(&ModelRequest::new(indirect), &JsonOutput)
        .unwrap();
    assert!(report.is_success());

    let record = harness.records.get(&fixture_uid()).unwrap().unwrap();
    assert!(!record.original_path.contains(".."));
    assert!(Path::new(&record.original_path).is_absolute());
    assert_eq!(record.original_path, canonical(&harness.root.join("PF05017.pdb")));
}

#[test]
fn panicking_converter_fails_only_its_branch() {
    let harness = Harness::new(MockScorer::default(), MockConverter::default());
    let source = harness.input("PF05017.pdb");
    let graph = TaskGraph::standard(harness.scorer.clone(), Arc::new(PanickingConverter)).unwrap();
    let pipeline = Pipeline::new(harness.workspace.clone(), harness.records.clone(), graph);

    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(pipeline.process(&ModelRequest::new(source), &JsonOutput));
    });
    let report = rx
        .recv_timeout(Duration::from_secs(10))
        .expect("pipeline returned after a task panic")
        .unwrap();

    assert_eq!(report.outcome(TaskId::Ingest).unwrap().state, TaskState::Done);
    assert_eq!(report.outcome(TaskId::QualityScore).unwrap().state, TaskState::Done);
    assert_eq!(report.outcome(TaskId::ConvertMmcif).unwrap().state, TaskState::Failed);
    assert_eq!(report.outcome(TaskId::ConvertBcif).unwrap().state, TaskState::Blocked);
    assert_matches!(
        report.into_result(),
        Err(BeaconError::TaskPanicked { task, message })
            if task == "convert_mmcif" && message == "converter crashed"
    );
}
