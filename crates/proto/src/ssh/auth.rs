//! User authentication protocol (RFC 4252) and the server-side engine.
//!
//! Methods in core: `none` (probe), `password`, `publickey` (two-phase:
//! key query answered with PK_OK, then a signature bound to the session
//! identifier), and `keyboard-interactive` (RFC 4256, multi-round
//! prompts).
//!
//! Whether a credential is good is never decided here; the
//! [`Authenticator`] policy object is injected and returns one of
//! ok / fail / partial / needs-more. The engine owns the bookkeeping:
//! attempt budget, method history, partial-success accumulation, banner.

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use skiff_platform::{SkiffError, SkiffResult};
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};
use zeroize::Zeroize;

use crate::ssh::hostkey;
use crate::ssh::message::MessageType;
use crate::ssh::service::SSH_CONNECTION;
use crate::ssh::wire;

/// Compares two byte strings in constant time.
pub fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.ct_eq(b).into()
}

/// One keyboard-interactive prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    /// Prompt text shown to the user.
    pub prompt: String,
    /// Whether the typed response may be echoed.
    pub echo: bool,
}

/// Authentication method carried by a USERAUTH_REQUEST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// No authentication; used to probe available methods.
    None,
    /// Password authentication.
    Password(String),
    /// Public key authentication.
    PublicKey {
        /// Algorithm name (e.g., "ssh-ed25519")
        algorithm: String,
        /// Public key blob
        public_key: Vec<u8>,
        /// Signature blob; absent during the key query phase
        signature: Option<Vec<u8>>,
    },
    /// Keyboard-interactive authentication.
    KeyboardInteractive {
        /// Comma-separated submethod hints (usually empty)
        submethods: String,
    },
}

impl AuthMethod {
    /// Returns the method's wire name.
    pub fn name(&self) -> &'static str {
        match self {
            AuthMethod::None => "none",
            AuthMethod::Password(_) => "password",
            AuthMethod::PublicKey { .. } => "publickey",
            AuthMethod::KeyboardInteractive { .. } => "keyboard-interactive",
        }
    }
}

impl Drop for AuthMethod {
    fn drop(&mut self) {
        if let AuthMethod::Password(password) = self {
            password.zeroize();
        }
    }
}

/// SSH_MSG_USERAUTH_REQUEST (RFC 4252 Section 5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    /// User name to authenticate as.
    pub user_name: String,
    /// Service to start afterwards (always "ssh-connection" here).
    pub service_name: String,
    /// Method and its payload.
    pub method: AuthMethod,
}

impl AuthRequest {
    /// Creates an authentication request.
    pub fn new(user_name: &str, service_name: &str, method: AuthMethod) -> Self {
        Self {
            user_name: user_name.to_string(),
            service_name: service_name.to_string(),
            method,
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthRequest as u8);
        wire::put_str(&mut buf, &self.user_name);
        wire::put_str(&mut buf, &self.service_name);
        wire::put_str(&mut buf, self.method.name());

        match &self.method {
            AuthMethod::None => {}
            AuthMethod::Password(password) => {
                wire::put_bool(&mut buf, false);
                wire::put_str(&mut buf, password);
            }
            AuthMethod::PublicKey {
                algorithm,
                public_key,
                signature,
            } => {
                wire::put_bool(&mut buf, signature.is_some());
                wire::put_str(&mut buf, algorithm);
                wire::put_string(&mut buf, public_key);
                if let Some(sig) = signature {
                    wire::put_string(&mut buf, sig);
                }
            }
            AuthMethod::KeyboardInteractive { submethods } => {
                wire::put_str(&mut buf, ""); // language
                wire::put_str(&mut buf, submethods);
            }
        }

        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        if data.is_empty() || data[0] != MessageType::UserauthRequest as u8 {
            return Err(SkiffError::Protocol(
                "Expected SSH_MSG_USERAUTH_REQUEST".to_string(),
            ));
        }
        let mut offset = 1;
        let user_name = wire::get_str(data, &mut offset)?.to_string();
        let service_name = wire::get_str(data, &mut offset)?.to_string();
        let method_name = wire::get_str(data, &mut offset)?.to_string();

        let method = match method_name.as_str() {
            "none" => AuthMethod::None,
            "password" => {
                let _change = wire::get_bool(data, &mut offset)?;
                let password = wire::get_str(data, &mut offset)?.to_string();
                AuthMethod::Password(password)
            }
            "publickey" => {
                let has_signature = wire::get_bool(data, &mut offset)?;
                let algorithm = wire::get_str(data, &mut offset)?.to_string();
                let public_key = wire::get_string(data, &mut offset)?.to_vec();
                let signature = if has_signature {
                    Some(wire::get_string(data, &mut offset)?.to_vec())
                } else {
                    None
                };
                AuthMethod::PublicKey {
                    algorithm,
                    public_key,
                    signature,
                }
            }
            "keyboard-interactive" => {
                let _language = wire::get_str(data, &mut offset)?;
                let submethods = wire::get_str(data, &mut offset)?.to_string();
                AuthMethod::KeyboardInteractive { submethods }
            }
            other => {
                return Err(SkiffError::Auth(format!(
                    "Unsupported authentication method '{}'",
                    other
                )))
            }
        };

        Ok(Self {
            user_name,
            service_name,
            method,
        })
    }
}

/// SSH_MSG_USERAUTH_FAILURE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthFailure {
    /// Methods that can continue.
    pub methods: Vec<String>,
    /// True after a method succeeded but more are required.
    pub partial_success: bool,
}

impl AuthFailure {
    /// Creates a failure listing the methods that can continue.
    pub fn new(methods: Vec<String>, partial_success: bool) -> Self {
        Self {
            methods,
            partial_success,
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthFailure as u8);
        wire::put_name_list(&mut buf, &self.methods);
        wire::put_bool(&mut buf, self.partial_success);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        if data.is_empty() || data[0] != MessageType::UserauthFailure as u8 {
            return Err(SkiffError::Protocol(
                "Expected SSH_MSG_USERAUTH_FAILURE".to_string(),
            ));
        }
        let mut offset = 1;
        let methods = wire::get_name_list(data, &mut offset)?;
        let partial_success = wire::get_bool(data, &mut offset)?;
        Ok(Self {
            methods,
            partial_success,
        })
    }
}

/// SSH_MSG_USERAUTH_BANNER.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthBanner {
    /// Banner text.
    pub message: String,
}

impl AuthBanner {
    /// Creates a banner.
    pub fn new(message: &str) -> Self {
        Self {
            message: message.to_string(),
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthBanner as u8);
        wire::put_str(&mut buf, &self.message);
        wire::put_str(&mut buf, "");
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        if data.is_empty() || data[0] != MessageType::UserauthBanner as u8 {
            return Err(SkiffError::Protocol(
                "Expected SSH_MSG_USERAUTH_BANNER".to_string(),
            ));
        }
        let mut offset = 1;
        let message = wire::get_str(data, &mut offset)?.to_string();
        Ok(Self { message })
    }
}

/// SSH_MSG_USERAUTH_PK_OK: the key query phase answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPkOk {
    /// Echoed algorithm name.
    pub algorithm: String,
    /// Echoed public key blob.
    pub public_key: Vec<u8>,
}

impl AuthPkOk {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthPkOk as u8);
        wire::put_str(&mut buf, &self.algorithm);
        wire::put_string(&mut buf, &self.public_key);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        if data.is_empty() || data[0] != MessageType::UserauthPkOk as u8 {
            return Err(SkiffError::Protocol(
                "Expected SSH_MSG_USERAUTH_PK_OK".to_string(),
            ));
        }
        let mut offset = 1;
        let algorithm = wire::get_str(data, &mut offset)?.to_string();
        let public_key = wire::get_string(data, &mut offset)?.to_vec();
        Ok(Self {
            algorithm,
            public_key,
        })
    }
}

/// SSH_MSG_USERAUTH_INFO_REQUEST (RFC 4256 Section 3.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoRequest {
    /// Name of the interaction (may be empty).
    pub name: String,
    /// Instruction text (may be empty).
    pub instruction: String,
    /// Prompts in order.
    pub prompts: Vec<Prompt>,
}

impl InfoRequest {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthPkOk as u8); // 60, method-specific
        wire::put_str(&mut buf, &self.name);
        wire::put_str(&mut buf, &self.instruction);
        wire::put_str(&mut buf, ""); // language
        buf.put_u32(self.prompts.len() as u32);
        for prompt in &self.prompts {
            wire::put_str(&mut buf, &prompt.prompt);
            wire::put_bool(&mut buf, prompt.echo);
        }
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        if data.is_empty() || data[0] != MessageType::UserauthPkOk as u8 {
            return Err(SkiffError::Protocol(
                "Expected SSH_MSG_USERAUTH_INFO_REQUEST".to_string(),
            ));
        }
        let mut offset = 1;
        let name = wire::get_str(data, &mut offset)?.to_string();
        let instruction = wire::get_str(data, &mut offset)?.to_string();
        let _language = wire::get_str(data, &mut offset)?;
        let count = wire::get_u32(data, &mut offset)?;
        let mut prompts = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let prompt = wire::get_str(data, &mut offset)?.to_string();
            let echo = wire::get_bool(data, &mut offset)?;
            prompts.push(Prompt { prompt, echo });
        }
        Ok(Self {
            name,
            instruction,
            prompts,
        })
    }
}

/// SSH_MSG_USERAUTH_INFO_RESPONSE (RFC 4256 Section 3.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoResponse {
    /// Responses, one per prompt, in order.
    pub responses: Vec<String>,
}

impl InfoResponse {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthInfoResponse as u8);
        buf.put_u32(self.responses.len() as u32);
        for response in &self.responses {
            wire::put_str(&mut buf, response);
        }
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        if data.is_empty() || data[0] != MessageType::UserauthInfoResponse as u8 {
            return Err(SkiffError::Protocol(
                "Expected SSH_MSG_USERAUTH_INFO_RESPONSE".to_string(),
            ));
        }
        let mut offset = 1;
        let count = wire::get_u32(data, &mut offset)?;
        let mut responses = Vec::with_capacity(count as usize);
        for _ in 0..count {
            responses.push(wire::get_str(data, &mut offset)?.to_string());
        }
        Ok(Self { responses })
    }
}

/// Builds the byte string a publickey signature covers (RFC 4252
/// Section 7): the session identifier followed by the request fields up to
/// and including the public key blob. Binding the session identifier in
/// prevents replay across transports.
pub fn construct_signature_data(
    session_id: &[u8],
    user_name: &str,
    service_name: &str,
    algorithm: &str,
    public_key: &[u8],
) -> Vec<u8> {
    let mut buf = BytesMut::new();
    wire::put_string(&mut buf, session_id);
    buf.put_u8(MessageType::UserauthRequest as u8);
    wire::put_str(&mut buf, user_name);
    wire::put_str(&mut buf, service_name);
    wire::put_str(&mut buf, "publickey");
    wire::put_bool(&mut buf, true);
    wire::put_str(&mut buf, algorithm);
    wire::put_string(&mut buf, public_key);
    buf.to_vec()
}

/// Outcome of one authentication attempt, decided by the policy object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Credentials accepted; authentication is complete.
    Ok,
    /// Credentials rejected.
    Fail,
    /// This method succeeded but further methods are required.
    Partial {
        /// Methods that still must succeed.
        remaining: Vec<String>,
    },
    /// More user input is needed (keyboard-interactive).
    NeedsMore {
        /// Prompts to present.
        prompts: Vec<Prompt>,
        /// Interaction name.
        name: String,
        /// Instruction text.
        instruction: String,
    },
}

/// Credential policy contract.
///
/// For `publickey` the engine calls twice: once without a signature (key
/// acceptability query) and once with the signature already verified
/// against the session identifier.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Judges one authentication attempt.
    async fn authenticate(
        &self,
        user_name: &str,
        method: &AuthMethod,
        session_id: &[u8],
    ) -> SkiffResult<AuthOutcome>;

    /// Judges keyboard-interactive responses from a prior `NeedsMore`.
    async fn check_responses(
        &self,
        _user_name: &str,
        _responses: &[String],
        _session_id: &[u8],
    ) -> SkiffResult<AuthOutcome> {
        Ok(AuthOutcome::Fail)
    }

    /// Methods advertised in USERAUTH_FAILURE.
    fn available_methods(&self) -> Vec<String> {
        vec![
            "publickey".to_string(),
            "password".to_string(),
            "keyboard-interactive".to_string(),
        ]
    }

    /// Banner shown before the first attempt, if any.
    fn banner(&self) -> Option<String> {
        None
    }
}

/// What the server session should send in reaction to an auth packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthAction {
    /// Send USERAUTH_BANNER.
    Banner(AuthBanner),
    /// Send USERAUTH_SUCCESS; the connection service starts.
    Success,
    /// Send USERAUTH_FAILURE.
    Failure(AuthFailure),
    /// Send USERAUTH_PK_OK.
    PkOk(AuthPkOk),
    /// Send USERAUTH_INFO_REQUEST and await the response.
    Info(InfoRequest),
    /// The attempt budget is exhausted; disconnect.
    Exhausted,
}

/// Server-side authentication state machine.
pub struct AuthEngine {
    authenticator: std::sync::Arc<dyn Authenticator>,
    max_attempts: u32,
    attempts: u32,
    authenticated: bool,
    banner_sent: bool,
    user_name: Option<String>,
    method_history: Vec<String>,
    partial_remaining: Option<Vec<String>>,
    pending_info: bool,
}

impl AuthEngine {
    /// Creates an engine with the given policy and attempt budget.
    pub fn new(authenticator: std::sync::Arc<dyn Authenticator>, max_attempts: u32) -> Self {
        Self {
            authenticator,
            max_attempts,
            attempts: 0,
            authenticated: false,
            banner_sent: false,
            user_name: None,
            method_history: Vec::new(),
            partial_remaining: None,
            pending_info: false,
        }
    }

    /// Returns true after USERAUTH_SUCCESS.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Returns the authenticated user name.
    pub fn user_name(&self) -> Option<&str> {
        self.user_name.as_deref()
    }

    /// Returns the names of methods attempted so far.
    pub fn method_history(&self) -> &[String] {
        &self.method_history
    }

    /// Handles one USERAUTH_REQUEST.
    pub async fn handle_request(
        &mut self,
        request: AuthRequest,
        session_id: &[u8],
    ) -> SkiffResult<Vec<AuthAction>> {
        if self.authenticated {
            // RFC 4252: requests after success may be silently ignored
            return Ok(Vec::new());
        }
        if request.service_name != SSH_CONNECTION {
            return Err(SkiffError::Auth(format!(
                "Authentication for unknown service '{}'",
                request.service_name
            )));
        }

        let mut actions = Vec::new();
        if !self.banner_sent {
            self.banner_sent = true;
            if let Some(text) = self.authenticator.banner() {
                actions.push(AuthAction::Banner(AuthBanner::new(&text)));
            }
        }

        self.method_history.push(request.method.name().to_string());
        self.pending_info = false;

        // Publickey key query: answer PK_OK without counting an attempt
        if let AuthMethod::PublicKey {
            algorithm,
            public_key,
            signature: None,
        } = &request.method
        {
            let outcome = self
                .authenticator
                .authenticate(&request.user_name, &request.method, session_id)
                .await?;
            match outcome {
                AuthOutcome::Ok | AuthOutcome::Partial { .. } => {
                    debug!(user = %request.user_name, "publickey query accepted");
                    actions.push(AuthAction::PkOk(AuthPkOk {
                        algorithm: algorithm.clone(),
                        public_key: public_key.clone(),
                    }));
                }
                _ => actions.push(self.record_failure(false)?),
            }
            return Ok(actions);
        }

        // Publickey with signature: verify the binding before consulting
        // the policy at all
        if let AuthMethod::PublicKey {
            algorithm,
            public_key,
            signature: Some(signature),
        } = &request.method
        {
            let signed = construct_signature_data(
                session_id,
                &request.user_name,
                &request.service_name,
                algorithm,
                public_key,
            );
            if hostkey::verify_signature(public_key, &signed, signature).is_err() {
                warn!(user = %request.user_name, "publickey signature verification failed");
                actions.push(self.record_failure(false)?);
                return Ok(actions);
            }
        }

        let outcome = self
            .authenticator
            .authenticate(&request.user_name, &request.method, session_id)
            .await?;
        actions.push(self.apply_outcome(outcome, &request.user_name)?);
        Ok(actions)
    }

    /// Handles a keyboard-interactive USERAUTH_INFO_RESPONSE.
    pub async fn handle_info_response(
        &mut self,
        response: InfoResponse,
        session_id: &[u8],
    ) -> SkiffResult<Vec<AuthAction>> {
        if !self.pending_info {
            return Err(SkiffError::Protocol(
                "USERAUTH_INFO_RESPONSE without outstanding prompts".to_string(),
            ));
        }
        self.pending_info = false;

        let user_name = self
            .user_name
            .clone()
            .ok_or_else(|| SkiffError::Protocol("Info response without user".to_string()))?;
        let outcome = self
            .authenticator
            .check_responses(&user_name, &response.responses, session_id)
            .await?;
        Ok(vec![self.apply_outcome(outcome, &user_name)?])
    }

    fn apply_outcome(&mut self, outcome: AuthOutcome, user_name: &str) -> SkiffResult<AuthAction> {
        match outcome {
            AuthOutcome::Ok => {
                // Honor an earlier partial-success requirement
                if let Some(remaining) = &self.partial_remaining {
                    if !remaining.is_empty() {
                        let remaining = remaining.clone();
                        let last = self.method_history.last().cloned().unwrap_or_default();
                        if remaining.contains(&last) {
                            // This was one of the required follow-ups
                            self.partial_remaining = None;
                        } else {
                            return self.record_failure(true);
                        }
                    }
                }
                info!(user = user_name, "authentication succeeded");
                self.authenticated = true;
                self.user_name = Some(user_name.to_string());
                Ok(AuthAction::Success)
            }
            AuthOutcome::Fail => self.record_failure(false),
            AuthOutcome::Partial { remaining } => {
                info!(user = user_name, remaining = ?remaining, "partial authentication success");
                self.user_name = Some(user_name.to_string());
                self.partial_remaining = Some(remaining.clone());
                Ok(AuthAction::Failure(AuthFailure::new(remaining, true)))
            }
            AuthOutcome::NeedsMore {
                prompts,
                name,
                instruction,
            } => {
                self.user_name = Some(user_name.to_string());
                self.pending_info = true;
                Ok(AuthAction::Info(InfoRequest {
                    name,
                    instruction,
                    prompts,
                }))
            }
        }
    }

    fn record_failure(&mut self, partial: bool) -> SkiffResult<AuthAction> {
        self.attempts += 1;
        if self.attempts >= self.max_attempts {
            warn!(attempts = self.attempts, "authentication budget exhausted");
            return Ok(AuthAction::Exhausted);
        }
        let methods = if partial {
            self.partial_remaining
                .clone()
                .unwrap_or_else(|| self.authenticator.available_methods())
        } else {
            self.authenticator.available_methods()
        };
        Ok(AuthAction::Failure(AuthFailure::new(methods, partial)))
    }
}

/// In-memory policy for tests and small deployments: a password table plus
/// a set of authorized public key blobs.
#[derive(Default)]
pub struct StaticAuthenticator {
    passwords: std::collections::HashMap<String, String>,
    authorized_keys: Vec<Vec<u8>>,
    banner: Option<String>,
}

impl StaticAuthenticator {
    /// Creates an empty policy that rejects everyone.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a username/password pair.
    pub fn with_password(mut self, user: &str, password: &str) -> Self {
        self.passwords.insert(user.to_string(), password.to_string());
        self
    }

    /// Registers an authorized public key blob (any user).
    pub fn with_authorized_key(mut self, public_blob: Vec<u8>) -> Self {
        self.authorized_keys.push(public_blob);
        self
    }

    /// Sets the pre-auth banner.
    pub fn with_banner(mut self, banner: &str) -> Self {
        self.banner = Some(banner.to_string());
        self
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn authenticate(
        &self,
        user_name: &str,
        method: &AuthMethod,
        _session_id: &[u8],
    ) -> SkiffResult<AuthOutcome> {
        match method {
            AuthMethod::None => Ok(AuthOutcome::Fail),
            AuthMethod::Password(password) => {
                let ok = self
                    .passwords
                    .get(user_name)
                    .map(|expected| {
                        constant_time_compare(expected.as_bytes(), password.as_bytes())
                    })
                    .unwrap_or(false);
                Ok(if ok { AuthOutcome::Ok } else { AuthOutcome::Fail })
            }
            AuthMethod::PublicKey { public_key, .. } => {
                let known = self.authorized_keys.iter().any(|k| k == public_key);
                Ok(if known { AuthOutcome::Ok } else { AuthOutcome::Fail })
            }
            AuthMethod::KeyboardInteractive { .. } => Ok(AuthOutcome::Fail),
        }
    }

    fn banner(&self) -> Option<String> {
        self.banner.clone()
    }
}
