//! Config file discovery and layering for the launcher

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use ml_essentials::runner::{CommandLine, MLRunnerConfig, MLRunnerConfigLoader};

fn write(path: &Path, content: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create parent dirs");
    }
    fs::write(path, content).expect("write config file");
}

#[test]
fn discovery_order_and_layering() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path();

    write(
        &root.join("sys1/.mlrun.yaml"),
        "clone_from: sys1\nargs: sys1/.mlrun.yaml args\n",
    );
    write(
        &root.join("sys2/.mlrun.yml"),
        "args: sys2/.mlrun.yml args\nname: sys2/.mlrun.yml\n",
    );
    write(
        &root.join("work/.mlrun.yml"),
        "name: work/.mlrun.yml\nserver: http://127.0.0.1:8080\n",
    );
    write(
        &root.join("work/.mlrun.yaml"),
        "server: http://127.0.0.1:8081\ntags: ['1', '2', '3']\n",
    );
    write(
        &root.join("work/.mlrun.json"),
        r#"{"tags": ["4", "5", "6"], "description": "work/.mlrun.json"}"#,
    );
    write(
        &root.join("work/nested/.mlrun.yml"),
        "description: work/nested/.mlrun.yml\nresume_from: xyz\n",
    );
    write(
        &root.join("config1.yml"),
        "resume_from: zyx\nsource.root: config1\n",
    );
    write(
        &root.join("config2.yml"),
        "source.root: config2\nintegration.log_file: config2.log\n",
    );

    let seed = MLRunnerConfig {
        env: BTreeMap::from([("a".to_string(), "1".to_string())]),
        clone_from: Some("code".to_string()),
        ..MLRunnerConfig::default()
    };
    let mut loader = MLRunnerConfigLoader::new(seed)
        .expect("loader should build")
        .config_files(vec![root.join("config1.yml"), root.join("config2.yml")])
        .work_dir(root.join("work/nested"))
        .system_paths(vec![root.join("sys1"), root.join("sys2")]);

    let expected: Vec<PathBuf> = vec![
        root.join("sys1/.mlrun.yaml"),
        root.join("sys2/.mlrun.yml"),
        root.join("work/.mlrun.yml"),
        root.join("work/.mlrun.yaml"),
        root.join("work/.mlrun.json"),
        root.join("work/nested/.mlrun.yml"),
        root.join("config1.yml"),
        root.join("config2.yml"),
    ];
    assert_eq!(loader.list_config_files(), expected);

    let mut load_order = Vec::new();
    let mut on_load = |path: &Path| load_order.push(path.to_path_buf());
    loader
        .load_config_files(Some(&mut on_load))
        .expect("config files should load");
    assert_eq!(load_order, expected);

    let config = loader.get().expect("merged config should deserialize");
    assert_eq!(config.integration.log_file, "config2.log");
    assert_eq!(config.source.root, Some(PathBuf::from("config2")));
    assert_eq!(config.resume_from.as_deref(), Some("zyx"));
    assert_eq!(config.description.as_deref(), Some("work/nested/.mlrun.yml"));
    assert_eq!(
        config.tags,
        Some(vec!["4".to_string(), "5".to_string(), "6".to_string()])
    );
    assert_eq!(config.server.as_deref(), Some("http://127.0.0.1:8081"));
    assert_eq!(config.name.as_deref(), Some("work/.mlrun.yml"));
    assert_eq!(
        config.args,
        Some(CommandLine::Shell("sys2/.mlrun.yml args".to_string()))
    );
    assert_eq!(config.clone_from.as_deref(), Some("sys1"));
    assert_eq!(config.env.get("a").map(String::as_str), Some("1"));
}

#[test]
fn bare_loader_finds_nothing() {
    let mut loader = MLRunnerConfigLoader::new(MLRunnerConfig::default())
        .expect("loader should build")
        .system_paths(Vec::new());
    assert_eq!(loader.list_config_files(), Vec::<PathBuf>::new());
    loader
        .load_config_files(None)
        .expect("loading nothing should succeed");
}

#[test]
fn later_files_override_earlier_fields() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path();
    write(&root.join("a.yml"), "server: http://first:8080\ngpu: [0]\n");
    write(&root.join("b.json"), r#"{"server": "http://second:8080"}"#);

    let mut loader = MLRunnerConfigLoader::new(MLRunnerConfig::default())
        .expect("loader should build")
        .system_paths(Vec::new())
        .config_files(vec![root.join("a.yml"), root.join("b.json")]);
    loader
        .load_config_files(None)
        .expect("config files should load");

    let config = loader.get().expect("merged config should deserialize");
    assert_eq!(config.server.as_deref(), Some("http://second:8080"));
    assert_eq!(config.gpu, vec![0]);
}

#[test]
fn validation_runs_on_the_merged_config() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path();
    write(&root.join("only.yml"), "server: http://127.0.0.1:8080\n");

    let mut loader = MLRunnerConfigLoader::new(MLRunnerConfig::default())
        .expect("loader should build")
        .system_paths(Vec::new())
        .config_files(vec![root.join("only.yml")]);
    loader
        .load_config_files(None)
        .expect("config files should load");

    let config = loader.get().expect("merged config should deserialize");
    let err = config.validate().expect_err("args are missing");
    assert_eq!(err.to_string(), "`args` is required");
}
