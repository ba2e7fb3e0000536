//! Source snapshot selection, copying, packing and cleanup

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use ml_essentials::runner::source::SourceCopier;
use zip::ZipArchive;

const INCLUDES: &[&str] = &[r".*\.(py|pl|rb|js|sh|r|bat|cmd|exe|jar)$"];
const EXCLUDES: &[&str] =
    &[r".*[\\/](\.svn|\.cvs|\.git|\.hg|\.DS_Store|\.idea|node_modules|__pycache__)$"];

fn patterns(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn seed_tree(root: &Path) {
    for (path, content) in [
        ("train.py", "print('train')"),
        ("lib/utils.py", "pass"),
        ("lib/weights.bin", "binary"),
        ("run.sh", "#!/bin/sh"),
        (".git/objects/aa.py", "not source"),
        ("__pycache__/train.cpython-311.py", "cache"),
        ("README.md", "docs"),
    ] {
        let file = root.join(path);
        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent).expect("create dirs");
        }
        fs::write(file, content).expect("write file");
    }
}

fn copier(source: &Path, dest: &Path) -> SourceCopier {
    SourceCopier::new(source, dest, &patterns(INCLUDES), &patterns(EXCLUDES))
        .expect("patterns should compile")
}

#[test]
fn selection_is_filtered_and_sorted() {
    let source = tempfile::tempdir().expect("tempdir");
    let dest = tempfile::tempdir().expect("tempdir");
    seed_tree(source.path());

    let selected = copier(source.path(), dest.path())
        .select()
        .expect("selection should succeed");
    assert_eq!(
        selected,
        vec![
            PathBuf::from("lib/utils.py"),
            PathBuf::from("run.sh"),
            PathBuf::from("train.py"),
        ]
    );
}

#[test]
fn missing_source_dir_is_an_error() {
    let dest = tempfile::tempdir().expect("tempdir");
    let result = copier(&dest.path().join("nope"), dest.path()).select();
    assert!(result.is_err());
}

#[test]
fn clone_preserves_layout() {
    let source = tempfile::tempdir().expect("tempdir");
    let dest = tempfile::tempdir().expect("tempdir");
    seed_tree(source.path());

    let mut copier = copier(source.path(), dest.path());
    let count = copier.clone_dir().expect("clone should succeed");
    assert_eq!(count, 3);
    assert_eq!(copier.file_count(), 3);
    assert!(dest.path().join("lib/utils.py").is_file());
    assert!(dest.path().join("train.py").is_file());
    assert!(!dest.path().join("README.md").exists());
    assert!(!dest.path().join(".git").exists());
}

#[test]
fn zip_contains_exactly_the_selection() {
    let source = tempfile::tempdir().expect("tempdir");
    let dest = tempfile::tempdir().expect("tempdir");
    seed_tree(source.path());

    let archive_file = dest.path().join("source.zip");
    let count = copier(source.path(), dest.path())
        .pack_zip(&archive_file)
        .expect("packing should succeed");
    assert_eq!(count, 3);

    let mut archive =
        ZipArchive::new(File::open(&archive_file).expect("open archive")).expect("valid archive");
    let names: Vec<String> = (0..archive.len())
        .map(|i| archive.by_index(i).expect("entry").name().to_string())
        .collect();
    assert_eq!(names, vec!["lib/utils.py", "run.sh", "train.py"]);

    let mut entry = archive.by_name("train.py").expect("entry should exist");
    let mut content = String::new();
    std::io::Read::read_to_string(&mut entry, &mut content).expect("read entry");
    assert_eq!(content, "print('train')");
}

#[test]
fn cleanup_removes_only_what_was_copied() {
    let source = tempfile::tempdir().expect("tempdir");
    let dest = tempfile::tempdir().expect("tempdir");
    seed_tree(source.path());

    let mut copier = copier(source.path(), dest.path());
    copier.clone_dir().expect("clone should succeed");

    // Files the program wrote afterwards must survive.
    fs::write(dest.path().join("result.json"), "{}").expect("write result");
    fs::create_dir_all(dest.path().join("lib/ckpt")).expect("create dir");
    fs::write(dest.path().join("lib/ckpt/epoch1.bin"), "w").expect("write checkpoint");

    copier.cleanup_dir().expect("cleanup should succeed");

    assert!(!dest.path().join("train.py").exists());
    assert!(!dest.path().join("lib/utils.py").exists());
    assert!(dest.path().join("result.json").is_file());
    assert!(dest.path().join("lib/ckpt/epoch1.bin").is_file());

    // A second cleanup is a no-op.
    copier.cleanup_dir().expect("cleanup should be idempotent");
}
