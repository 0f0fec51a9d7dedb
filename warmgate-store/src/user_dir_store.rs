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
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{Level, event};
use warmgate_error::{Code, Error, ResultExt, make_input_err};

/// Directory mode for everything under a user's tree. The mount is shared
/// between tenants, so nothing may be group or world accessible.
const USER_DIR_MODE: u32 = 0o700;

/// Subdirectories provisioned inside every user directory.
const USER_SUBDIRS: &[&str] = &[".config", ".cache"];

/// Lifetime of a session token file.
const TOKEN_TTL_MS: u64 = 24 * 60 * 60 * 1000;

#[derive(Serialize)]
struct SessionToken<'a> {
    env: &'a str,
    access_token: &'a str,
    token_type: &'static str,
    expires_at: u64,
}

/// Provisions per-user home directories on a shared mount.
///
/// Layout is `<mount>/<environment>/<user_id>`; all paths are created with
/// owner-only permissions. Operations are idempotent so callers can invoke
/// them on every acquire without tracking provisioning state.
#[derive(Debug)]
pub struct UserDirStore {
    mount_path: PathBuf,
    environment: String,
}

impl UserDirStore {
    pub fn new(mount_path: impl Into<PathBuf>, environment: impl Into<String>) -> Self {
        Self {
            mount_path: mount_path.into(),
            environment: environment.into(),
        }
    }

    #[must_use]
    pub fn mount_path(&self) -> &Path {
        &self.mount_path
    }

    /// Root under which all user directories for this environment live.
    #[must_use]
    pub fn environment_root(&self) -> PathBuf {
        self.mount_path.join(&self.environment)
    }

    /// Resolves the directory for `user_id`, rejecting ids that could
    /// escape the environment root.
    pub fn user_dir(&self, user_id: &str) -> Result<PathBuf, Error> {
        if user_id.is_empty()
            || user_id == "."
            || user_id == ".."
            || user_id.contains(['/', '\\', '\0'])
        {
            return Err(make_input_err!("Invalid user id {user_id:?}"));
        }
        Ok(self.environment_root().join(user_id))
    }

    /// Whether the backing mount is present. A missing mount is not fatal to
    /// the gateway; provisioning is skipped until it appears.
    pub async fn is_mounted(&self) -> bool {
        tokio::fs::metadata(&self.mount_path)
            .await
            .is_ok_and(|metadata| metadata.is_dir())
    }

    /// Creates the user's directory tree if it does not exist and returns its
    /// path. Permissions are re-applied even when the tree already exists, so
    /// a directory that drifted to a wider mode is healed on next use.
    pub async fn ensure_user_directory(&self, user_id: &str) -> Result<PathBuf, Error> {
        let user_dir = self.user_dir(user_id)?;
        let existed = tokio::fs::metadata(&user_dir).await.is_ok();

        tokio::fs::create_dir_all(&user_dir)
            .await
            .err_tip(|| format!("Failed to create user directory {user_dir:?}"))?;
        tokio::fs::set_permissions(&user_dir, Permissions::from_mode(USER_DIR_MODE))
            .await
            .err_tip(|| format!("Failed to set permissions on {user_dir:?}"))?;

        for subdir in USER_SUBDIRS {
            let subdir_path = user_dir.join(subdir);
            tokio::fs::create_dir_all(&subdir_path)
                .await
                .err_tip(|| format!("Failed to create {subdir_path:?}"))?;
            tokio::fs::set_permissions(&subdir_path, Permissions::from_mode(USER_DIR_MODE))
                .await
                .err_tip(|| format!("Failed to set permissions on {subdir_path:?}"))?;
        }

        if !existed {
            event!(Level::INFO, user_id, path = ?user_dir, "Provisioned user directory");
        }
        Ok(user_dir)
    }

    /// Writes a session token under the user's `.config` directory. The tree
    /// is provisioned first if needed. Returns the token file path.
    pub async fn write_token(
        &self,
        user_id: &str,
        access_token: &str,
        now_ms: u64,
    ) -> Result<PathBuf, Error> {
        let user_dir = self.ensure_user_directory(user_id).await?;
        let token_path = user_dir.join(".config").join("token.json");
        let token = SessionToken {
            env: &self.environment,
            access_token,
            token_type: "Bearer",
            expires_at: now_ms.saturating_add(TOKEN_TTL_MS),
        };
        let contents = serde_json::to_vec_pretty(&token)
            .err_tip(|| format!("Failed to serialize token for user {user_id}"))?;
        tokio::fs::write(&token_path, contents)
            .await
            .err_tip(|| format!("Failed to write token file {token_path:?}"))?;
        tokio::fs::set_permissions(&token_path, Permissions::from_mode(0o600))
            .await
            .err_tip(|| format!("Failed to set permissions on {token_path:?}"))?;
        Ok(token_path)
    }

    /// Names of all user directories provisioned in this environment. Returns
    /// an empty list when the environment root does not exist yet.
    pub async fn list_user_directories(&self) -> Result<Vec<String>, Error> {
        let root = self.environment_root();
        let mut read_dir = match tokio::fs::read_dir(&root).await {
            Ok(read_dir) => read_dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(Error::from(err)
                    .append(format!("Failed to list user directories in {root:?}")));
            }
        };
        let mut users = Vec::new();
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .err_tip(|| format!("Failed reading entry in {root:?}"))?
        {
            let file_type = entry
                .file_type()
                .await
                .err_tip(|| format!("Failed to stat {:?}", entry.path()))?;
            if file_type.is_dir() {
                if let Ok(name) = entry.file_name().into_string() {
                    users.push(name);
                }
            }
        }
        users.sort();
        Ok(users)
    }

    /// Total size in bytes of all regular files under the user's directory.
    /// Symlinks are counted by their own size and never followed.
    pub async fn directory_size(&self, user_id: &str) -> Result<u64, Error> {
        let user_dir = self.user_dir(user_id)?;
        if tokio::fs::symlink_metadata(&user_dir).await.is_err() {
            return Err(Error::new(
                Code::NotFound,
                format!("No directory for user {user_id}"),
            ));
        }
        let mut total = 0u64;
        let mut pending = vec![user_dir];
        while let Some(dir) = pending.pop() {
            let mut read_dir = tokio::fs::read_dir(&dir)
                .await
                .err_tip(|| format!("Failed to read {dir:?}"))?;
            while let Some(entry) = read_dir
                .next_entry()
                .await
                .err_tip(|| format!("Failed reading entry in {dir:?}"))?
            {
                let metadata = entry
                    .metadata()
                    .await
                    .err_tip(|| format!("Failed to stat {:?}", entry.path()))?;
                if metadata.is_dir() {
                    pending.push(entry.path());
                } else {
                    total = total.saturating_add(metadata.len());
                }
            }
        }
        Ok(total)
    }
}
