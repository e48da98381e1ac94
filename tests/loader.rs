use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use beacon_pipeline::error::BeaconError;
use beacon_pipeline::loader::{LoaderKind, ModelData, load_model_data};
use beacon_pipeline::records::{JsonRecordStore, RecordStore};
use beacon_pipeline::uid::derive_uid;

const FIXTURE: &str = concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/tests/fixtures/swissmodel_P01308.json"
);

fn setup() -> (tempfile::TempDir, JsonRecordStore) {
    let temp = tempfile::tempdir().unwrap();
    let store =
        JsonRecordStore::open(Utf8PathBuf::from_path_buf(temp.path().join("records")).unwrap())
            .unwrap();
    (temp, store)
}

#[test]
fn loads_first_structure_into_record() {
    let (_temp, store) = setup();
    let uid = derive_uid(b"P01308 model");
    store.get_or_create(&uid, "P01308.pdb").unwrap();

    let record = load_model_data(
        &store,
        &uid,
        "swissmodel".parse().unwrap(),
        &Utf8PathBuf::from(FIXTURE),
        None,
    )
    .unwrap();

    assert!(record.model_data_created_at.is_some());
    assert_eq!(record.identity, Some(100.0));
    assert_eq!(record.similarity, Some(0.61));
    assert_eq!(record.oligo_state.as_deref(), Some("monomer"));
    assert_eq!(record.coverage, Some(0.782));

    let data: ModelData = serde_json::from_value(record.model_data.unwrap()).unwrap();
    assert_eq!(data.uniprot_accession, "P01308");
    assert_eq!(data.template.as_deref(), Some("6jr3.1.A"));
    assert_eq!(data.uniprot_from, Some(25));
    assert_eq!(data.qmean_avg_local_score, Some(0.74));

    let stored = store.get(&uid).unwrap().unwrap();
    assert_eq!(stored.model_data_created_at, record.model_data_created_at);
}

#[test]
fn selects_structure_by_coordinates() {
    let (_temp, store) = setup();
    let uid = derive_uid(b"P01308 dimer");
    store.get_or_create(&uid, "P01308.pdb").unwrap();

    let uri = "https://swissmodel.expasy.org/repository/uniprot/P01308.pdb?range=90-110&template=1zni.1.A&provider=swissmodel";
    let record = load_model_data(
        &store,
        &uid,
        LoaderKind::SwissModel,
        &Utf8PathBuf::from(FIXTURE),
        Some(uri),
    )
    .unwrap();
    assert_eq!(record.oligo_state.as_deref(), Some("homo-2-mer"));
    assert_eq!(record.coverage, Some(0.19));
}

#[test]
fn loading_needs_existing_record() {
    let (_temp, store) = setup();
    let err = load_model_data(
        &store,
        &derive_uid(b"unknown"),
        LoaderKind::SwissModel,
        &Utf8PathBuf::from(FIXTURE),
        None,
    )
    .unwrap_err();
    assert_matches!(err, BeaconError::RecordNotFound(_));
}

#[test]
fn unknown_loader_is_rejected_up_front() {
    assert_matches!(
        "modbase".parse::<LoaderKind>(),
        Err(BeaconError::UnknownLoader(message)) if message.contains("swissmodel")
    );
}
