//! Server-side authentication flows: Basic, Digest and Negotiate.
//!
//! One mode is active per server. On success the engine sets the
//! `authorized` flag and the authenticated user on the context; the raw
//! credential token is exposed as a bearer-like value for downstream
//! handlers.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use md5::{Digest as _, Md5};
use parking_lot::Mutex;

use crate::context::Context;
use crate::error::{CoreError, CoreResult};

/// Password verification callback for [`AuthMode::BasicCallback`].
pub type BasicVerifier = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

/// Credential store for Basic authentication.
pub trait CredentialStore: Send + Sync {
    fn check(&self, user: &str, password: &str) -> bool;
}

/// Digest needs the cleartext (or pre-hashed HA1) secret per user.
pub trait DigestStore: Send + Sync {
    fn password_for(&self, user: &str) -> Option<String>;
}

/// Outcome of one GSS/SSPI round.
pub enum NegotiateStep {
    /// Hand this token back to the client and keep the exchange open.
    Continue(Vec<u8>),
    /// The context is established; `token` is echoed to the client.
    Done { user: String, token: Vec<u8> },
}

/// Platform GSS/SSPI binding, named at this interface and provided by the
/// embedder. Only the two-way exchange is supported.
pub trait NegotiateBinding: Send + Sync {
    fn step(&self, token_in: &[u8]) -> CoreResult<NegotiateStep>;
}

pub enum AuthMode {
    None,
    BasicCallback {
        realm: String,
        verify: BasicVerifier,
    },
    BasicStore {
        realm: String,
        store: Arc<dyn CredentialStore>,
    },
    Digest {
        realm: String,
        store: Arc<dyn DigestStore>,
        /// Salts the per-connection nonce derivation.
        secret: u64,
    },
    Negotiate {
        binding: Arc<dyn NegotiateBinding>,
    },
}

/// What the connection layer should do next.
#[derive(Debug, PartialEq, Eq)]
pub enum AuthOutcome {
    /// No authentication configured.
    NotRequired,
    /// Credentials accepted; context flags are set.
    Authorized,
    /// Emit 401 with this `WWW-Authenticate` value.
    Challenge(String),
    /// Invalid retry inside the cooldown bucket: 403 and close.
    Denied,
}

/// Cooldown epoch: wall-clock milliseconds bucketed at 4 KiB granularity
/// (~4.1 s), matching the re-challenge rate limit.
fn cooldown_bucket() -> u64 {
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    ms >> 12
}

pub struct AuthEngine {
    mode: AuthMode,
    /// Per-IP bucket of the last 401 issued, for the retry cooldown.
    challenged: Mutex<HashMap<IpAddr, u64>>,
}

impl AuthEngine {
    pub fn new(mode: AuthMode) -> Self {
        Self {
            mode,
            challenged: Mutex::new(HashMap::new()),
        }
    }

    pub fn none() -> Self {
        Self::new(AuthMode::None)
    }

    pub fn basic_callback(realm: impl Into<String>, verify: BasicVerifier) -> Self {
        Self::new(AuthMode::BasicCallback {
            realm: realm.into(),
            verify,
        })
    }

    pub fn basic_store(realm: impl Into<String>, store: Arc<dyn CredentialStore>) -> Self {
        Self::new(AuthMode::BasicStore {
            realm: realm.into(),
            store,
        })
    }

    pub fn digest(realm: impl Into<String>, store: Arc<dyn DigestStore>, secret: u64) -> Self {
        Self::new(AuthMode::Digest {
            realm: realm.into(),
            store,
            secret,
        })
    }

    pub fn negotiate(binding: Arc<dyn NegotiateBinding>) -> Self {
        Self::new(AuthMode::Negotiate { binding })
    }

    pub fn enabled(&self) -> bool {
        !matches!(self.mode, AuthMode::None)
    }

    /// Run the configured flow against the request in `ctx`.
    pub fn authenticate(&self, ctx: &mut Context) -> AuthOutcome {
        let authorization = ctx.head.authorization.clone();
        match &self.mode {
            AuthMode::None => AuthOutcome::NotRequired,
            AuthMode::BasicCallback { realm, verify } => {
                let verify = verify.clone();
                self.basic_flow(ctx, realm, &authorization, move |u, p| verify(u, p))
            }
            AuthMode::BasicStore { realm, store } => {
                let store = store.clone();
                self.basic_flow(ctx, realm, &authorization, move |u, p| store.check(u, p))
            }
            AuthMode::Digest {
                realm,
                store,
                secret,
            } => self.digest_flow(ctx, realm, store.as_ref(), *secret, &authorization),
            AuthMode::Negotiate { binding } => {
                self.negotiate_flow(ctx, binding.as_ref(), &authorization)
            }
        }
    }

    fn basic_flow(
        &self,
        ctx: &mut Context,
        realm: &str,
        authorization: &str,
        verify: impl Fn(&str, &str) -> bool,
    ) -> AuthOutcome {
        let challenge = format!("Basic realm=\"{}\"", realm);
        let Some(b64) = authorization.strip_prefix("Basic ") else {
            return self.challenge_or_deny(ctx.remote_ip, challenge, authorization.is_empty());
        };
        let decoded = match BASE64.decode(b64.trim()) {
            Ok(d) => d,
            Err(_) => return self.challenge_or_deny(ctx.remote_ip, challenge, false),
        };
        let Ok(pair) = String::from_utf8(decoded) else {
            return self.challenge_or_deny(ctx.remote_ip, challenge, false);
        };
        let Some((user, password)) = pair.split_once(':') else {
            return self.challenge_or_deny(ctx.remote_ip, challenge, false);
        };
        if verify(user, password) {
            self.mark_authorized(ctx, user, b64.trim());
            AuthOutcome::Authorized
        } else {
            tracing::debug!(user, ip = %ctx.remote_ip, "basic credentials rejected");
            self.challenge_or_deny(ctx.remote_ip, challenge, false)
        }
    }

    /// Nonce bound to the connection so a challenge cannot be replayed on
    /// another socket.
    fn digest_nonce(conn_id: u32, secret: u64) -> String {
        let mut h = Md5::new();
        h.update(conn_id.to_le_bytes());
        h.update(secret.to_le_bytes());
        hex_lower(&h.finalize())
    }

    fn digest_flow(
        &self,
        ctx: &mut Context,
        realm: &str,
        store: &dyn DigestStore,
        secret: u64,
        authorization: &str,
    ) -> AuthOutcome {
        let nonce = Self::digest_nonce(ctx.connection_id, secret);
        let opaque = format!("{:08x}", ctx.connection_id);
        let challenge = format!(
            "Digest realm=\"{}\", qop=\"auth\", nonce=\"{}\", opaque=\"{}\"",
            realm, nonce, opaque
        );

        let Some(fields) = authorization.strip_prefix("Digest ") else {
            return self.challenge_or_deny(ctx.remote_ip, challenge, authorization.is_empty());
        };
        let fields = parse_digest_fields(fields);
        let get = |k: &str| fields.get(k).map(String::as_str).unwrap_or("");

        // The URI must match the one from the command line; a mismatch is
        // a plain rejection, not a protocol error.
        if get("uri") != ctx.url || get("nonce") != nonce {
            return self.challenge_or_deny(ctx.remote_ip, challenge, false);
        }
        let user = get("username").to_string();
        let Some(password) = store.password_for(&user) else {
            return self.challenge_or_deny(ctx.remote_ip, challenge, false);
        };

        let ha1 = md5_hex(&format!("{}:{}:{}", user, realm, password));
        let ha2 = md5_hex(&format!("{}:{}", ctx.method.as_str(), get("uri")));
        let expected = if get("qop").is_empty() {
            md5_hex(&format!("{}:{}:{}", ha1, nonce, ha2))
        } else {
            md5_hex(&format!(
                "{}:{}:{}:{}:{}:{}",
                ha1,
                nonce,
                get("nc"),
                get("cnonce"),
                get("qop"),
                ha2
            ))
        };

        if expected == get("response") {
            let token = authorization.to_string();
            self.mark_authorized(ctx, &user, &token);
            AuthOutcome::Authorized
        } else {
            tracing::debug!(user, ip = %ctx.remote_ip, "digest response mismatch");
            self.challenge_or_deny(ctx.remote_ip, challenge, false)
        }
    }

    fn negotiate_flow(
        &self,
        ctx: &mut Context,
        binding: &dyn NegotiateBinding,
        authorization: &str,
    ) -> AuthOutcome {
        let Some(b64) = authorization.strip_prefix("Negotiate ") else {
            return self.challenge_or_deny(
                ctx.remote_ip,
                "Negotiate".to_string(),
                authorization.is_empty(),
            );
        };
        let Ok(token_in) = BASE64.decode(b64.trim()) else {
            return self.challenge_or_deny(ctx.remote_ip, "Negotiate".to_string(), false);
        };
        match binding.step(&token_in) {
            Ok(NegotiateStep::Done { user, token }) => {
                self.mark_authorized(ctx, &user, b64.trim());
                if !token.is_empty() {
                    ctx.resp_headers.push_str(&format!(
                        "WWW-Authenticate: Negotiate {}\r\n",
                        BASE64.encode(&token)
                    ));
                }
                AuthOutcome::Authorized
            }
            Ok(NegotiateStep::Continue(token)) => AuthOutcome::Challenge(format!(
                "Negotiate {}",
                BASE64.encode(&token)
            )),
            Err(e) => {
                tracing::debug!(error = %e, ip = %ctx.remote_ip, "negotiate step failed");
                self.challenge_or_deny(ctx.remote_ip, "Negotiate".to_string(), false)
            }
        }
    }

    fn mark_authorized(&self, ctx: &mut Context, user: &str, token: &str) {
        ctx.authorized = true;
        ctx.authenticated_user = user.to_string();
        ctx.bearer = token.to_string();
        self.challenged.lock().remove(&ctx.remote_ip);
    }

    /// First contact (no credentials) always gets a challenge. Invalid
    /// credentials re-challenge once per cooldown bucket; a retry inside
    /// the same bucket is denied outright.
    fn challenge_or_deny(&self, ip: IpAddr, challenge: String, first_contact: bool) -> AuthOutcome {
        if first_contact {
            return AuthOutcome::Challenge(challenge);
        }
        let bucket = cooldown_bucket();
        let mut challenged = self.challenged.lock();
        match challenged.get(&ip) {
            Some(&last) if last == bucket => AuthOutcome::Denied,
            _ => {
                challenged.insert(ip, bucket);
                AuthOutcome::Challenge(challenge)
            }
        }
    }
}

fn parse_digest_fields(s: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for part in s.split(',') {
        if let Some((k, v)) = part.split_once('=') {
            let v = v.trim().trim_matches('"');
            map.insert(k.trim().to_ascii_lowercase(), v.to_string());
        }
    }
    map
}

fn md5_hex(s: &str) -> String {
    let mut h = Md5::new();
    h.update(s.as_bytes());
    hex_lower(&h.finalize())
}

fn hex_lower(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}
