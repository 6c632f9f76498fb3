// Copyright 2016 Mozilla Foundation
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Authentication precedence for the remote RPC client (spec.md §4.5):
//! OAuth2 > LUCI local auth > static header > none.

use std::sync::atomic::{AtomicBool, Ordering};

/// One configured credential source, in the precedence order the spec
/// requires. The proxy picks the first one present at startup and does
/// not fall through at call time -- only OAuth2's *validity* can change
/// mid-run (a refresh can fail), which is what `is_oauth_valid` tracks.
pub enum AuthMethod {
    OAuth2 { token: String, valid: AtomicBool },
    LuciLocalAuth { token: String },
    StaticHeader { header_value: String },
    None,
}

impl AuthMethod {
    pub fn oauth2(token: impl Into<String>) -> Self {
        AuthMethod::OAuth2 { token: token.into(), valid: AtomicBool::new(true) }
    }

    pub fn luci_local_auth(token: impl Into<String>) -> Self {
        AuthMethod::LuciLocalAuth { token: token.into() }
    }

    pub fn static_header(value: impl Into<String>) -> Self {
        AuthMethod::StaticHeader { header_value: value.into() }
    }

    /// Pick the highest-precedence source that's actually configured.
    pub fn select(
        oauth2_token: Option<String>,
        luci_token: Option<String>,
        static_header: Option<String>,
    ) -> Self {
        if let Some(t) = oauth2_token {
            AuthMethod::oauth2(t)
        } else if let Some(t) = luci_token {
            AuthMethod::luci_local_auth(t)
        } else if let Some(h) = static_header {
            AuthMethod::static_header(h)
        } else {
            AuthMethod::None
        }
    }

    pub fn authorization_header(&self) -> Option<String> {
        match self {
            AuthMethod::OAuth2 { token, .. } => Some(format!("Bearer {}", token)),
            AuthMethod::LuciLocalAuth { token } => Some(format!("Bearer {}", token)),
            AuthMethod::StaticHeader { header_value } => Some(header_value.clone()),
            AuthMethod::None => None,
        }
    }

    /// Only OAuth2 retries on 401 -- retrying a static header or absent
    /// auth on 401 can never succeed (spec.md §4.5, §7 TransportAuth).
    pub fn is_oauth_valid(&self) -> bool {
        match self {
            AuthMethod::OAuth2 { valid, .. } => valid.load(Ordering::SeqCst),
            _ => false,
        }
    }

    /// Mark the current OAuth2 token as rejected by the backend (e.g. a
    /// refresh attempt failed); a no-op for other auth sources.
    pub fn invalidate_oauth(&self) {
        if let AuthMethod::OAuth2 { valid, .. } = self {
            valid.store(false, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence_prefers_oauth2_over_everything() {
        let auth = AuthMethod::select(Some("tok".into()), Some("luci".into()), Some("X".into()));
        assert!(matches!(auth, AuthMethod::OAuth2 { .. }));
    }

    #[test]
    fn precedence_falls_back_through_luci_to_static_to_none() {
        assert!(matches!(AuthMethod::select(None, Some("luci".into()), Some("X".into())), AuthMethod::LuciLocalAuth { .. }));
        assert!(matches!(AuthMethod::select(None, None, Some("X".into())), AuthMethod::StaticHeader { .. }));
        assert!(matches!(AuthMethod::select(None, None, None), AuthMethod::None));
    }

    #[test]
    fn only_oauth2_is_ever_considered_retryable_on_401() {
        let oauth = AuthMethod::oauth2("tok");
        assert!(oauth.is_oauth_valid());
        oauth.invalidate_oauth();
        assert!(!oauth.is_oauth_valid());
        let static_auth = AuthMethod::static_header("X-Api-Key: abc");
        assert!(!static_auth.is_oauth_valid());
    }
}
