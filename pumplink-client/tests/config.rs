use std::io::Write;

use pumplink_client::config::{
    ClientConfig, ConfigLoadError, ConfigSaveError, MAX_CONFIG_BYTES, load_config,
    load_config_from_path, save_config_with_retry,
};

#[test]
fn load_config_rejects_oversized_file() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = dir.path().join("config.json");

    let mut file = std::fs::File::create(&path).expect("create config.json");
    file.write_all(&vec![b'a'; (MAX_CONFIG_BYTES as usize) + 1024])
        .expect("write oversized config.json");
    drop(file);

    let err = load_config_from_path(&path).expect_err("oversized file should error");
    let msg = err.to_string();
    assert!(msg.contains("too large"), "unexpected error: {msg}");
}

#[test]
fn missing_config_is_not_an_error() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let loaded = load_config(&dir.path().join("config.json")).expect("missing file is fine");
    assert!(loaded.is_none());
}

#[test]
fn saved_config_loads_back_without_leftover_temp_file() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = dir.path().join("config.json");
    let config = ClientConfig {
        api_base_url: "http://127.0.0.1:8080/api/v1".to_owned(),
        device_id: 3,
    };

    save_config_with_retry(&path, &config).expect("save config");
    save_config_with_retry(&path, &config).expect("overwrite config");

    let loaded = load_config(&path).expect("load config").expect("config present");
    assert_eq!(loaded, config);
    assert!(!path.with_extension("json.tmp").exists());
}

#[test]
fn invalid_config_is_neither_saved_nor_loaded() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = dir.path().join("config.json");
    let config = ClientConfig {
        api_base_url: "   ".to_owned(),
        device_id: 1,
    };

    let err = save_config_with_retry(&path, &config).expect_err("blank URL should fail");
    assert!(matches!(err, ConfigSaveError::Invalid(_)), "{err}");
    assert!(!path.exists());

    std::fs::write(&path, r#"{"api_base_url":"mailto:ops@example.com","device_id":1}"#)
        .expect("write config.json");
    let err = load_config_from_path(&path).expect_err("non-http URL should fail");
    assert!(matches!(err, ConfigLoadError::Invalid(_)), "{err}");
}
