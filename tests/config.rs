//! Configuration Integration Tests
//!
//! Config file discovery, settings persistence and the plan they produce.

use std::path::Path;

use taintbomb::config::{
    load_config_from, Feature, SettingsStore, YamlSettingsStore, CONFIG_DIR, CONFIG_FILE,
};
use taintbomb::core::obfuscation::HelperOs;
use taintbomb::core::ObfuscationPlan;
use tempfile::TempDir;

fn no_env(_: &str) -> Option<String> {
    None
}

fn project(root: &Path, config: &str) {
    std::fs::create_dir_all(root.join(CONFIG_DIR)).unwrap();
    std::fs::write(root.join(CONFIG_DIR).join(CONFIG_FILE), config).unwrap();

    let java = root.join("pyscripts").join("java");
    std::fs::create_dir_all(&java).unwrap();
    std::fs::write(java.join("keyDecryptLinux.java"), "class K {}").unwrap();
    std::fs::write(java.join("stringDecryptLinux.java"), "class S {}").unwrap();
}

#[test]
fn test_settings_changes_reach_the_plan() {
    let temp = TempDir::new().unwrap();
    project(
        temp.path(),
        "version: \"1.0\"\ninterpreter: python3.12\npaths:\n  scripts: ./pyscripts\n",
    );

    let config = load_config_from(temp.path(), Path::new("/unused"), no_env).unwrap();
    let mut store = YamlSettingsStore::open(&config.settings_path(temp.path())).unwrap();
    store.set_flag(Feature::IdentifierObfuscation, false);
    store.set_flag(Feature::InsertDummyCode, false);
    store.set_api_key("sk-project".to_string());
    store.save().unwrap();

    // Reload as a fresh process would.
    let config = load_config_from(temp.path(), Path::new("/unused"), no_env).unwrap();
    assert_eq!(config.interpreter, "python3.12");

    let plan = ObfuscationPlan::from_config(&config)
        .with_os(HelperOs::Linux)
        .build(Path::new("/src"), Path::new("/out"))
        .unwrap();

    assert!(!plan.get_stage("identifierObfuscate").unwrap().enabled);
    let main = plan.get_stage("main").unwrap();
    assert_eq!(main.invocation[0], "python3.12");
    assert_eq!(&main.invocation[4..], &["sk-project", "true", "true", "false"]);
}

#[test]
fn test_env_api_key_wins_over_file() {
    let temp = TempDir::new().unwrap();
    project(temp.path(), "version: \"1.0\"\napi_key: from-file\n");

    let config = load_config_from(temp.path(), Path::new("/unused"), |key| {
        (key == "TAINTBOMB_API_KEY").then(|| "from-env".to_string())
    })
    .unwrap();

    assert_eq!(config.settings.api_key, "from-env");
}

#[test]
fn test_settings_file_created_next_to_cwd() {
    let temp = TempDir::new().unwrap();
    let config = load_config_from(temp.path(), &temp.path().join("home"), no_env).unwrap();

    let path = config.settings_path(temp.path());
    assert_eq!(path, temp.path().join(CONFIG_DIR).join(CONFIG_FILE));

    let mut store = YamlSettingsStore::open(&path).unwrap();
    store.set_flag(Feature::RemoveComments, false);
    store.save().unwrap();

    let reloaded = load_config_from(temp.path(), &temp.path().join("home"), no_env).unwrap();
    assert!(!reloaded.settings.features.remove_comments);
    assert_eq!(reloaded.config_file, Some(path));
}
