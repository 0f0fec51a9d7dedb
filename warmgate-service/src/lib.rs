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

pub mod gateway_server;
pub mod worker_socket_server;

use std::sync::Arc;

use warmgate_pool::pool_registry::PoolRegistry;
use warmgate_store::user_dir_store::UserDirStore;

/// Shared state handed to every HTTP and WebSocket handler.
#[derive(Clone)]
pub struct GatewayState {
    pub registry: Arc<PoolRegistry>,
    pub store: Arc<UserDirStore>,
}
