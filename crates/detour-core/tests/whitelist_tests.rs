//! Whitelist persistence tests

use std::fs;

use detour_core::{Error, Whitelist};
use tempfile::TempDir;

#[test]
fn test_save_then_load_keeps_permanent_entries_only() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("whitelist.txt");

    let whitelist = Whitelist::new();
    whitelist.add("b.example:443", true);
    whitelist.add("a.example:80", true);
    whitelist.add("temp.example:80", false);
    whitelist.save_file(&path).unwrap();

    let loaded = Whitelist::from_file(&path).unwrap();
    assert_eq!(loaded.permanent_entries(), vec!["a.example:80", "b.example:443"]);
    assert!(!loaded.contains("temp.example:80"));
    assert_eq!(loaded.file().as_deref(), Some(path.as_path()));
}

#[test]
fn test_load_skips_comments_and_malformed_lines() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("whitelist.txt");
    fs::write(
        &path,
        "# header\n\n  blocked.example:443  \nno-port\n:80\nbad.example:99999\n[::1]:8080\n",
    )
    .unwrap();

    let whitelist = Whitelist::new();
    assert_eq!(whitelist.load_file(&path).unwrap(), 2);
    assert!(whitelist.is_permanent("blocked.example:443"));
    assert!(whitelist.is_permanent("[::1]:8080"));
    assert_eq!(whitelist.len(), 2);
}

#[test]
fn test_save_writes_header() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("whitelist.txt");

    let whitelist = Whitelist::with_entries(["blocked.example:443"]);
    whitelist.save_file(&path).unwrap();

    let content = fs::read_to_string(&path).unwrap();
    assert!(content.starts_with('#'));
    assert!(content.ends_with("blocked.example:443\n"));
}

#[test]
fn test_save_uses_associated_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("learned.txt");

    let whitelist = Whitelist::new();
    assert!(!whitelist.save().unwrap());

    whitelist.set_file(&path);
    whitelist.add("blocked.example:443", true);
    assert!(whitelist.save().unwrap());

    let reloaded = Whitelist::from_file(&path).unwrap();
    assert!(reloaded.is_permanent("blocked.example:443"));
}

#[test]
fn test_missing_file_is_an_error() {
    let dir = TempDir::new().unwrap();
    let err = Whitelist::from_file(dir.path().join("missing.txt")).unwrap_err();
    assert!(matches!(err, Error::Whitelist { .. }));
}
