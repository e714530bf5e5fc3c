//! Configuration layering tests
//!
//! Environment variables are process-wide, so every env assertion lives in
//! this one test binary, and in a single test so nothing runs in parallel.

use std::io::Write;
use std::time::Duration;

use tempfile::NamedTempFile;

use streamrelay_core::config::{load_config_from_path, ConfigOverrides, ConfigSource};

const ENV_VARS: [&str; 4] = [
    "STREAMRELAY_CHUNK_SIZE",
    "STREAMRELAY_TEARDOWN_ON_ERROR",
    "STREAMRELAY_MAX_STALLED_WRITES",
    "STREAMRELAY_POLL_INTERVAL_MS",
];

fn clear_config_env_vars() {
    for var in ENV_VARS {
        std::env::remove_var(var);
    }
}

#[test]
fn test_priority_file_then_env_then_cli() {
    clear_config_env_vars();

    let mut file = NamedTempFile::new().unwrap();
    file.write_all(
        br#"
[pipe]
chunk_size = 2048
teardown_on_error = true

[writer]
max_stalled_writes = 8

[run_loop]
poll_interval_ms = 50
"#,
    )
    .unwrap();
    let path = Some(file.path().to_path_buf());

    // File only
    let config = load_config_from_path(path.clone()).unwrap();
    assert_eq!(config.pipe.chunk_size, 2048);
    assert!(config.pipe.teardown_on_error);
    assert_eq!(config.pipe.writer.max_stalled_writes, 8);
    assert_eq!(config.run_loop.poll_interval, Duration::from_millis(50));
    assert_eq!(config.source(), ConfigSource::File);
    assert_eq!(config.config_file_path, path);

    // Env beats file
    std::env::set_var("STREAMRELAY_CHUNK_SIZE", "1024");
    std::env::set_var("STREAMRELAY_TEARDOWN_ON_ERROR", "false");
    std::env::set_var("STREAMRELAY_MAX_STALLED_WRITES", "3");
    std::env::set_var("STREAMRELAY_POLL_INTERVAL_MS", "20");
    let mut config = load_config_from_path(path.clone()).unwrap();
    assert_eq!(config.pipe.chunk_size, 1024);
    assert!(!config.pipe.teardown_on_error);
    assert_eq!(config.pipe.writer.max_stalled_writes, 3);
    assert_eq!(config.run_loop.poll_interval, Duration::from_millis(20));
    assert_eq!(config.source(), ConfigSource::Env);

    // CLI beats env
    ConfigOverrides::new().with_chunk_size(64).apply(&mut config);
    assert_eq!(config.pipe.chunk_size, 64);
    assert_eq!(config.pipe.writer.max_stalled_writes, 3);
    assert_eq!(config.source(), ConfigSource::Cli);
    assert!(config.validate().is_ok());

    // Unparseable env values are ignored
    std::env::set_var("STREAMRELAY_CHUNK_SIZE", "lots");
    let config = load_config_from_path(path).unwrap();
    assert_eq!(config.pipe.chunk_size, 2048);

    // An env value that parses but is out of range fails validation
    std::env::set_var("STREAMRELAY_CHUNK_SIZE", "0");
    let config = load_config_from_path(None).unwrap();
    assert!(config.validate().is_err());

    clear_config_env_vars();
}
