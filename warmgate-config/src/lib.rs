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

use std::collections::HashMap;
use std::path::PathBuf;

use warmgate_error::{Error, ResultExt, make_input_err};

const ENV_GATEWAY_PORT: &str = "GATEWAY_PORT";
const ENV_STORE_MOUNT_PATH: &str = "STORE_MOUNT_PATH";
const ENV_ENVIRONMENT: &str = "ENVIRONMENT";
const ENV_WORKER_TIMEOUT_S: &str = "WORKER_TIMEOUT_S";

const fn default_listen_port() -> u16 {
    5174
}

fn default_mount_path() -> PathBuf {
    PathBuf::from("/mnt/userdirs")
}

fn default_environment() -> String {
    "test".to_string()
}

/// Configuration for the gateway process. Every option is sourced from the
/// process environment; none of them alter registry semantics, only how the
/// collaborators are wired together.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// TCP port the HTTP/WebSocket listener binds to.
    pub listen_port: u16,

    /// Root of the shared filesystem the user directory store provisions
    /// into. Shell variables (`~`, `$HOME`, ...) are expanded.
    pub mount_path: PathBuf,

    /// Deployment environment tag, forwarded to workers in the session
    /// init notification and used as the per-environment directory prefix.
    pub environment: String,

    /// Evict workers whose last heartbeat is older than this many seconds.
    /// 0 disables the sweep; heartbeats are then informational only.
    pub worker_timeout_s: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            mount_path: default_mount_path(),
            environment: default_environment(),
            worker_timeout_s: 0,
        }
    }
}

impl GatewayConfig {
    /// Builds a config from the process environment.
    pub fn from_env() -> Result<Self, Error> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_vars(&vars)
    }

    /// Same as [`Self::from_env`], but reads from an explicit map. Used in
    /// unit tests to avoid mutating process globals.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, Error> {
        let mut config = Self::default();
        if let Some(port) = vars.get(ENV_GATEWAY_PORT) {
            config.listen_port = port
                .parse()
                .err_tip(|| format!("Invalid {ENV_GATEWAY_PORT} value '{port}'"))?;
        }
        if let Some(mount_path) = vars.get(ENV_STORE_MOUNT_PATH) {
            let expanded = shellexpand::full(mount_path)
                .map_err(|e| make_input_err!("Invalid {ENV_STORE_MOUNT_PATH} value: {e}"))?;
            config.mount_path = PathBuf::from(expanded.as_ref());
        }
        if let Some(environment) = vars.get(ENV_ENVIRONMENT) {
            config.environment = environment.clone();
        }
        if let Some(timeout_s) = vars.get(ENV_WORKER_TIMEOUT_S) {
            config.worker_timeout_s = timeout_s
                .parse()
                .err_tip(|| format!("Invalid {ENV_WORKER_TIMEOUT_S} value '{timeout_s}'"))?;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults_when_unset() {
        let config = GatewayConfig::from_vars(&HashMap::new()).unwrap();
        assert_eq!(config.listen_port, 5174);
        assert_eq!(config.mount_path, PathBuf::from("/mnt/userdirs"));
        assert_eq!(config.environment, "test");
        assert_eq!(config.worker_timeout_s, 0);
    }

    #[test]
    fn reads_all_recognized_options() {
        let vars = HashMap::from([
            (ENV_GATEWAY_PORT.to_string(), "9000".to_string()),
            (ENV_STORE_MOUNT_PATH.to_string(), "/mnt/efs".to_string()),
            (ENV_ENVIRONMENT.to_string(), "staging".to_string()),
            (ENV_WORKER_TIMEOUT_S.to_string(), "120".to_string()),
        ]);
        let config = GatewayConfig::from_vars(&vars).unwrap();
        assert_eq!(config.listen_port, 9000);
        assert_eq!(config.mount_path, PathBuf::from("/mnt/efs"));
        assert_eq!(config.environment, "staging");
        assert_eq!(config.worker_timeout_s, 120);
    }

    #[test]
    fn rejects_unparsable_port() {
        let vars = HashMap::from([(ENV_GATEWAY_PORT.to_string(), "not-a-port".to_string())]);
        let err = GatewayConfig::from_vars(&vars).unwrap_err();
        assert_eq!(err.code, warmgate_error::Code::InvalidArgument);
    }
}
