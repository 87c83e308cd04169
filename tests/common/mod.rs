#![allow(dead_code)]

use std::{
    fs,
    path::{Path, PathBuf},
};

use cmdforge::{
    build::{BuildOptions, Builder},
    config::{DotenvFile, ProjectPaths},
    toolchain::Toolchain,
};
use tempfile::TempDir;

pub fn fixtures_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/commands")
}

pub fn copy_dir(from: &Path, to: &Path) {
    fs::create_dir_all(to).unwrap();
    for entry in fs::read_dir(from).unwrap() {
        let entry = entry.unwrap();
        let target = to.join(entry.file_name());
        if entry.file_type().unwrap().is_dir() {
            copy_dir(&entry.path(), &target);
        } else {
            fs::copy(entry.path(), target).unwrap();
        }
    }
}

/// A project base holding a copy of the fixture commands.
pub fn project() -> (TempDir, ProjectPaths) {
    let dir = tempfile::tempdir().unwrap();
    let paths = ProjectPaths::new(dir.path());
    copy_dir(&fixtures_dir(), &paths.commands_dir);
    (dir, paths)
}

pub async fn builder(paths: &ProjectPaths, options: BuildOptions) -> Builder {
    let env = DotenvFile::new(&paths.env_file, true);
    Builder::with_env_source(paths.clone(), options, &env, Toolchain::default())
        .await
        .unwrap()
}

pub fn ids(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|id| id.to_string()).collect()
}
