use std::fs;

use camino::Utf8PathBuf;

use beacon_pipeline::domain::ArtifactKind;
use beacon_pipeline::store::{self, Workspace};
use beacon_pipeline::uid::derive_uid;

#[test]
fn layout_paths() {
    let temp = tempfile::tempdir().unwrap();
    let base = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let workspace = Workspace::new(base.clone());
    let uid = derive_uid(b"PF05017");
    let shard = &uid.as_str()[..2];

    for (kind, suffix) in [
        (ArtifactKind::Pdb, ".pdb"),
        (ArtifactKind::Mmcif, ".mmcif"),
        (ArtifactKind::Bcif, ".bcif"),
        (ArtifactKind::QmeanJson, "_qmean.json"),
    ] {
        let expected = base.join(shard).join(format!("{uid}{suffix}"));
        assert_eq!(workspace.artifact_path(&uid, kind), expected);
        assert_eq!(store::resolve_path(&base, &uid, suffix), expected);
    }
}

#[test]
fn ensure_path_creates_shard_directory() {
    let temp = tempfile::tempdir().unwrap();
    let base = Utf8PathBuf::from_path_buf(temp.path().join("work")).unwrap();
    let uid = derive_uid(b"PF05017");

    let path = store::ensure_path(&base, &uid, ".pdb").unwrap();
    assert!(base.join(uid.shard()).as_std_path().is_dir());
    assert!(!path.as_std_path().exists());
}

#[test]
fn copy_is_byte_identical() {
    let temp = tempfile::tempdir().unwrap();
    let base = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let source = base.join("in.pdb");
    fs::write(source.as_std_path(), b"ATOM      1  CA  GLY A   1\nEND\n").unwrap();
    let dest = base.join("ab").join("copy.pdb");

    store::copy_file_atomic(&source, &dest).unwrap();
    assert_eq!(
        fs::read(dest.as_std_path()).unwrap(),
        fs::read(source.as_std_path()).unwrap()
    );
}
