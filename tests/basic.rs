
use std::fs;
use tempfile::tempdir;
use dp_console::daemon_conf::{backup_path, parse, ConfStore, ConfStoreError, ConfigPatch, Section, Warning};
use time::OffsetDateTime;

const CONF: &str = "\
# deeprotection
language=en_US
disable=false
mode=normal
web_ip=127.0.0.1
web_port=8080

# ---- protected_paths_list ----
/etc
/usr/lib

# ---- command_intercept_rules ----
rm -rf /*";

#[test]
fn update_backs_up_then_rewrites_in_place() {
    let dir = tempdir().unwrap();
    let p = dir.path().join("deeprotection.conf");
    fs::write(&p, CONF).unwrap();
    let store = ConfStore::new(&p);

    let body = serde_json::json!({"basic": {"mode": "strict"}});
    let patch = ConfigPatch::from_json(&body).unwrap().value;
    let out = store.update(&patch).unwrap();
    assert!(out.warnings.is_empty());

    // backup holds the pre-update text
    let backup = out.value;
    let name = backup.file_name().unwrap().to_string_lossy().to_string();
    let suffix = name.rsplit('.').next().unwrap();
    assert!(name.starts_with("deeprotection.conf.bak."));
    assert_eq!(suffix.len(), 14);
    assert!(suffix.chars().all(|c| c.is_ascii_digit()));
    assert_eq!(fs::read_to_string(&backup).unwrap(), CONF);

    // same line position, trailing newline added
    let updated = fs::read_to_string(&p).unwrap();
    let old: Vec<&str> = CONF.lines().collect();
    let new: Vec<&str> = updated.lines().collect();
    assert_eq!(old.len(), new.len());
    let idx = old.iter().position(|l| *l == "mode=normal").unwrap();
    assert_eq!(new[idx], "mode=strict");
    assert!(updated.ends_with("rm -rf /*\n"));
}

#[test]
fn no_op_update_is_idempotent() {
    let dir = tempdir().unwrap();
    let p = dir.path().join("deeprotection.conf");
    fs::write(&p, CONF).unwrap();
    let store = ConfStore::new(&p);

    let before = store.load().unwrap().value;
    store.update(&ConfigPatch::default()).unwrap();
    let after = store.load().unwrap().value;
    assert_eq!(before, after);
}

#[test]
fn section_replacement_round_trips() {
    let dir = tempdir().unwrap();
    let p = dir.path().join("deeprotection.conf");
    fs::write(&p, CONF).unwrap();
    let store = ConfStore::new(&p);

    let paths = vec!["/opt/app".to_string(), "/srv".to_string(), "/etc".to_string()];
    let patch = ConfigPatch { protected_paths: Some(paths.clone()), ..Default::default() };
    store.update(&patch).unwrap();

    let text = fs::read_to_string(&p).unwrap();
    assert!(text.contains("# ---- protected_paths_list ----\n/opt/app\n/srv\n/etc\n"));
    let doc = parse(&text).value;
    assert_eq!(doc.protected_paths, paths);
    assert_eq!(doc.command_rules, vec!["rm -rf /*"]);
    assert_eq!(doc.basic.get("mode").map(String::as_str), Some("normal"));
}

#[test]
fn unknown_section_is_skipped_not_fatal() {
    let dir = tempdir().unwrap();
    let p = dir.path().join("deeprotection.conf");
    fs::write(&p, "mode=normal\n# ---- protected_paths_list ----\n/etc\n").unwrap();
    let store = ConfStore::new(&p);

    let patch = ConfigPatch {
        protected_paths: Some(vec!["/var".into()]),
        command_rules: Some(vec!["reboot".into()]),
        ..Default::default()
    };
    let out = store.update(&patch).unwrap();
    assert_eq!(out.warnings, vec![Warning::UnknownSection { section: Section::CommandRules }]);
    assert_eq!(store.load().unwrap().value.protected_paths, vec!["/var"]);
}

#[test]
fn missing_file_fails_without_backup() {
    let dir = tempdir().unwrap();
    let store = ConfStore::new(dir.path().join("absent.conf"));
    assert!(store.update(&ConfigPatch::default()).is_err());
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn latin1_comment_does_not_block_load_or_update() {
    let dir = tempdir().unwrap();
    let p = dir.path().join("deeprotection.conf");
    let original: &[u8] = b"# caf\xE9\nmode=normal\n# protected_paths_list\n/etc\n";
    fs::write(&p, original).unwrap();
    let store = ConfStore::new(&p);

    let doc = store.load().unwrap().value;
    assert_eq!(doc.basic.get("mode").map(String::as_str), Some("normal"));
    assert_eq!(doc.protected_paths, vec!["/etc"]);

    let body = serde_json::json!({"basic": {"mode": "strict"}});
    let patch = ConfigPatch::from_json(&body).unwrap().value;
    let out = store.update(&patch).unwrap();
    assert_eq!(fs::read(&out.value).unwrap(), original);
    assert_eq!(fs::read(&p).unwrap(), b"# caf\xE9\nmode=strict\n# protected_paths_list\n/etc\n");
}

#[test]
fn failed_backup_leaves_config_untouched() {
    let dir = tempdir().unwrap();
    let p = dir.path().join("deeprotection.conf");
    fs::write(&p, CONF).unwrap();
    let store = ConfStore::new(&p);

    let at = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
    let blocked = backup_path(&p, at);
    fs::create_dir(&blocked).unwrap();

    let mut patch = ConfigPatch::default();
    patch.basic.insert("mode".into(), "strict".into());
    let err = store.update_at(&patch, at).unwrap_err();
    assert!(matches!(err, ConfStoreError::Backup { ref path, .. } if *path == blocked));
    assert_eq!(fs::read_to_string(&p).unwrap(), CONF);
    assert!(blocked.is_dir());
}
