//! Coverage for secret resolution, the fallback policy and env files.

use std::collections::HashMap;
use std::fs;

use nebula::credentials::{
    load_env_file, CoreSecrets, CredentialError, LICENSE_KEY_VAR, ROOT_SEED_VAR,
};

fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect();
    move |key| map.get(key).cloned()
}

#[test]
fn provided_secrets_are_used_verbatim() {
    let secrets = CoreSecrets::resolve(env_of(&[
        (LICENSE_KEY_VAR, "lic-123"),
        (ROOT_SEED_VAR, "seed-456"),
    ]));

    assert_eq!(secrets.license_signature().expose(), "lic-123");
    assert_eq!(secrets.root_seed().expose(), "seed-456");
    assert!(secrets.insecure_fallbacks().is_empty());
    assert!(secrets.enforce(false, true).is_ok());
}

#[test]
fn unset_secrets_fall_back_and_are_flagged() {
    let secrets = CoreSecrets::resolve(env_of(&[(LICENSE_KEY_VAR, "lic-123")]));

    assert_eq!(secrets.license_signature().expose(), "lic-123");
    assert!(!secrets.root_seed().expose().is_empty());
    assert_eq!(secrets.insecure_fallbacks(), &[ROOT_SEED_VAR]);
}

#[test]
fn strict_policy_refuses_fallbacks() {
    let secrets = CoreSecrets::resolve(env_of(&[]));

    let err = secrets.enforce(false, true).expect_err("fallbacks refused");
    let CredentialError::InsecureDefaults(vars) = &err;
    assert_eq!(vars, &vec![LICENSE_KEY_VAR, ROOT_SEED_VAR]);
    assert!(err.to_string().contains(LICENSE_KEY_VAR));
}

#[test]
fn override_or_development_mode_tolerates_fallbacks() {
    let secrets = CoreSecrets::resolve(env_of(&[]));

    assert!(secrets.enforce(true, true).is_ok());
    assert!(secrets.enforce(false, false).is_ok());
}

#[test]
fn resolved_secrets_never_appear_in_debug_output() {
    let secrets = CoreSecrets::resolve(env_of(&[
        (LICENSE_KEY_VAR, "lic-very-secret"),
        (ROOT_SEED_VAR, "seed-very-secret"),
    ]));

    let debug = format!("{secrets:?}");
    assert!(!debug.contains("very-secret"));
    assert!(debug.contains("__REDACTED__"));
}

#[test]
fn env_file_entries_are_loaded() {
    let tmp = tempfile::tempdir().expect("temp dir");
    let path = tmp.path().join("node.env");
    fs::write(
        &path,
        "# vault secrets\nTITAN_LICENSE_KEY=lic-from-file\nTITAN_ROOT_SEED=\"quoted seed\"\n",
    )
    .expect("write env file");

    let vars = load_env_file(&path).expect("env file loads");
    assert_eq!(vars.get(LICENSE_KEY_VAR).map(String::as_str), Some("lic-from-file"));
    assert_eq!(vars.get(ROOT_SEED_VAR).map(String::as_str), Some("quoted seed"));
}

#[test]
fn missing_env_file_is_an_error() {
    let tmp = tempfile::tempdir().expect("temp dir");
    assert!(load_env_file(&tmp.path().join("absent.env")).is_err());
}
