// Copyright 2024 The Warmgate Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fs::Permissions;
use std::os::unix::fs::PermissionsExt;

use pretty_assertions::assert_eq;
use tempfile::TempDir;
use warmgate_macro::warmgate_test;
use warmgate_store::user_dir_store::UserDirStore;

const ENVIRONMENT: &str = "test";

fn make_store() -> (TempDir, UserDirStore) {
    let mount = TempDir::new().unwrap();
    let store = UserDirStore::new(mount.path(), ENVIRONMENT);
    (mount, store)
}

#[warmgate_test]
async fn ensure_user_directory_creates_private_tree() {
    let (_mount, store) = make_store();

    let user_dir = store.ensure_user_directory("alice").await.unwrap();
    assert!(user_dir.ends_with("test/alice"));

    for path in [
        user_dir.clone(),
        user_dir.join(".config"),
        user_dir.join(".cache"),
    ] {
        let metadata = tokio::fs::metadata(&path).await.unwrap();
        assert!(metadata.is_dir());
        assert_eq!(metadata.permissions().mode() & 0o777, 0o700, "{path:?}");
    }
}

#[warmgate_test]
async fn ensure_user_directory_heals_drifted_permissions() {
    let (_mount, store) = make_store();
    let user_dir = store.ensure_user_directory("alice").await.unwrap();
    tokio::fs::set_permissions(&user_dir, Permissions::from_mode(0o755))
        .await
        .unwrap();

    let again = store.ensure_user_directory("alice").await.unwrap();
    assert_eq!(again, user_dir);
    let metadata = tokio::fs::metadata(&user_dir).await.unwrap();
    assert_eq!(metadata.permissions().mode() & 0o777, 0o700);
}

#[warmgate_test]
async fn user_ids_that_escape_the_root_are_rejected() {
    let (_mount, store) = make_store();
    for bad_id in ["", ".", "..", "a/b", "a\\b", "..\u{0}"] {
        assert!(store.user_dir(bad_id).is_err(), "{bad_id:?}");
        assert!(store.ensure_user_directory(bad_id).await.is_err());
    }
}

#[warmgate_test]
async fn write_token_produces_bearer_token_with_ttl() {
    let (_mount, store) = make_store();

    let token_path = store.write_token("alice", "tok-123", 1_000).await.unwrap();
    assert!(token_path.ends_with("alice/.config/token.json"));

    let contents = tokio::fs::read(&token_path).await.unwrap();
    let token: serde_json::Value = serde_json::from_slice(&contents).unwrap();
    assert_eq!(token["env"], "test");
    assert_eq!(token["access_token"], "tok-123");
    assert_eq!(token["token_type"], "Bearer");
    assert_eq!(token["expires_at"], 1_000 + 24 * 60 * 60 * 1000);

    let metadata = tokio::fs::metadata(&token_path).await.unwrap();
    assert_eq!(metadata.permissions().mode() & 0o777, 0o600);
}

#[warmgate_test]
async fn list_user_directories_is_empty_before_provisioning() {
    let (_mount, store) = make_store();
    assert_eq!(store.list_user_directories().await.unwrap(), Vec::<String>::new());
}

#[warmgate_test]
async fn list_user_directories_returns_sorted_names() {
    let (_mount, store) = make_store();
    store.ensure_user_directory("bob").await.unwrap();
    store.ensure_user_directory("alice").await.unwrap();

    // Stray files at the environment root are not user directories.
    tokio::fs::write(store.environment_root().join("junk.txt"), b"x")
        .await
        .unwrap();

    assert_eq!(
        store.list_user_directories().await.unwrap(),
        vec!["alice".to_string(), "bob".to_string()]
    );
}

#[warmgate_test]
async fn directory_size_sums_nested_files() {
    let (_mount, store) = make_store();
    let user_dir = store.ensure_user_directory("alice").await.unwrap();
    tokio::fs::write(user_dir.join("a.bin"), vec![0u8; 100])
        .await
        .unwrap();
    tokio::fs::write(user_dir.join(".config").join("b.bin"), vec![0u8; 50])
        .await
        .unwrap();

    assert_eq!(store.directory_size("alice").await.unwrap(), 150);
}

#[warmgate_test]
async fn directory_size_of_unknown_user_is_an_error() {
    let (_mount, store) = make_store();
    assert!(store.directory_size("ghost").await.is_err());
}

#[warmgate_test]
async fn is_mounted_reflects_mount_presence() {
    let (mount, store) = make_store();
    assert!(store.is_mounted().await);
    drop(mount);
    assert!(!store.is_mounted().await);
}
