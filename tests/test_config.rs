use std::sync::Mutex;

use beacon::config::{CONFIG_ENV, Config, LISTEN_ENV};

// The environment is process-wide; tests touching it take turns.
static ENV_LOCK: Mutex<()> = Mutex::new(());

#[test]
fn test_config_default_address() {
    let _guard = ENV_LOCK.lock().unwrap();
    unsafe {
        std::env::remove_var(LISTEN_ENV);
        std::env::remove_var(CONFIG_ENV);
    }
    let cfg = Config::load();
    assert_eq!(cfg.listen_addr, "127.0.0.1:8080");
}

#[test]
fn test_config_custom_address_from_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    unsafe {
        std::env::set_var(LISTEN_ENV, "0.0.0.0:3000");
    }
    let cfg = Config::load();
    assert_eq!(cfg.listen_addr, "0.0.0.0:3000");
    unsafe {
        std::env::remove_var(LISTEN_ENV);
    }
}

#[test]
fn test_config_file_then_env_override() {
    let _guard = ENV_LOCK.lock().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("beacon.yaml");
    std::fs::write(&path, "listen_addr: \"127.0.0.1:9000\"\ndocument_root: /srv/www\n").unwrap();

    unsafe {
        std::env::set_var(CONFIG_ENV, &path);
        std::env::remove_var(LISTEN_ENV);
    }
    let cfg = Config::load();
    assert_eq!(cfg.listen_addr, "127.0.0.1:9000");
    assert_eq!(cfg.document_root.as_deref(), Some(std::path::Path::new("/srv/www")));

    unsafe {
        std::env::set_var(LISTEN_ENV, "127.0.0.1:9001");
    }
    let cfg = Config::load();
    assert_eq!(cfg.listen_addr, "127.0.0.1:9001");

    unsafe {
        std::env::remove_var(CONFIG_ENV);
        std::env::remove_var(LISTEN_ENV);
    }
}

#[test]
fn test_config_broken_file_falls_back_to_defaults() {
    let _guard = ENV_LOCK.lock().unwrap();
    unsafe {
        std::env::set_var(CONFIG_ENV, "/nonexistent/beacon.yaml");
        std::env::remove_var(LISTEN_ENV);
    }
    let cfg = Config::load();
    assert_eq!(cfg.listen_addr, "127.0.0.1:8080");
    unsafe {
        std::env::remove_var(CONFIG_ENV);
    }
}

#[test]
fn test_config_from_yaml_partial() {
    let yaml = r#"
limits:
  max_header_lines: 20
  write_chunk_size: 1024
auth:
  realm: "files@example.com"
  digest: false
  protected_paths: ["/private"]
  users:
    alice: secret
  nonce_lifetime_secs: 60
"#;
    let cfg = Config::from_yaml(yaml).unwrap();

    assert_eq!(cfg.listen_addr, "127.0.0.1:8080");
    assert_eq!(cfg.limits.max_header_lines, 20);
    assert_eq!(cfg.limits.write_chunk_size, 1024);
    assert_eq!(cfg.limits.max_header_line_length, 8190);
    assert_eq!(cfg.limits.max_consecutive_errors, 3);
    assert_eq!(cfg.auth.realm, "files@example.com");
    assert!(!cfg.auth.digest);
    assert_eq!(cfg.auth.users.get("alice").map(String::as_str), Some("secret"));
    assert_eq!(cfg.auth.nonce_lifetime(), std::time::Duration::from_secs(60));
    assert_eq!(cfg.auth.max_nonces, 1024);
    assert_eq!(cfg.index_files, vec!["index.html", "index.htm"]);
}

#[test]
fn test_config_invalid_yaml() {
    assert!(Config::from_yaml("limits: [1, 2").is_err());
}

#[test]
fn test_config_clone() {
    let cfg1 = Config::default();
    let cfg2 = cfg1.clone();
    assert_eq!(cfg1.listen_addr, cfg2.listen_addr);
    assert_eq!(cfg1.limits.parse_limits(), cfg2.limits.parse_limits());
}
