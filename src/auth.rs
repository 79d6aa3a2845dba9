// asyncoro-net - distributed coroutine transport: peer discovery, request
// pipeline, and file transfer for a mesh of scheduler instances.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// 20 random bytes, hex-rendered, generated once per instance and carried in
/// every ping/pong so the receiver can recompute the auth code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(String);

impl Signature {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 20];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// `sha1(signature || secret)`, hex-rendered. Compared byte-for-byte on
/// every non-`ping` inbound verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthCode([u8; 20]);

impl AuthCode {
    pub fn compute(signature: &Signature, secret: &str) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(signature.as_str().as_bytes());
        hasher.update(secret.as_bytes());
        let digest = hasher.finalize();
        let mut out = [0u8; 20];
        out.copy_from_slice(&digest);
        Self(out)
    }
}

impl fmt::Display for AuthCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Per-instance authentication material. `None` when the instance runs
/// unsecured: signature and auth code are both absent and unauthenticated
/// requests are accepted.
#[derive(Debug, Clone)]
pub struct AuthState {
    secret: Option<String>,
    signature: Option<Signature>,
    auth_code: Option<AuthCode>,
}

impl AuthState {
    pub fn new(secret: Option<String>) -> Self {
        match secret {
            None => Self {
                secret: None,
                signature: None,
                auth_code: None,
            },
            Some(secret) => {
                let signature = Signature::generate();
                let auth_code = AuthCode::compute(&signature, &secret);
                Self {
                    secret: Some(secret),
                    signature: Some(signature),
                    auth_code: Some(auth_code),
                }
            }
        }
    }

    pub fn signature(&self) -> Option<&Signature> {
        self.signature.as_ref()
    }

    pub fn auth_code(&self) -> Option<AuthCode> {
        self.auth_code
    }

    /// Recompute the auth code a remote peer would have, given the signature
    /// it announced in its ping/pong.
    pub fn remote_auth_code(&self, remote_signature: &Signature) -> Option<AuthCode> {
        self.secret
            .as_ref()
            .map(|secret| AuthCode::compute(remote_signature, secret))
    }

    /// Whether an inbound request's auth field matches ours (or we run
    /// unsecured, in which case everything matches).
    pub fn accepts(&self, req_auth: Option<AuthCode>) -> bool {
        self.auth_code == req_auth
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_secret_yields_matching_auth_code() {
        let sig = Signature::generate();
        let a = AuthCode::compute(&sig, "shared-secret");
        let b = AuthCode::compute(&sig, "shared-secret");
        assert_eq!(a, b);
    }

    #[test]
    fn mismatched_secret_yields_different_auth_code() {
        let sig = Signature::generate();
        let a = AuthCode::compute(&sig, "secret-a");
        let b = AuthCode::compute(&sig, "secret-b");
        assert_ne!(a, b);
    }

    #[test]
    fn unsecured_state_has_no_auth_code() {
        let state = AuthState::new(None);
        assert!(state.auth_code().is_none());
        assert!(state.accepts(None));
    }
}
