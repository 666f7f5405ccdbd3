//! Login pipeline: session check, detect, execute, post-login validate

use qaflow_browser::{BrowserSession, DomSnapshot};
use qaflow_common::{
    AuthConfig, AuthType, BrowserAction, Control, ControlKind, Error, InputType, NetworkExchange,
    Question, Result, RunState, LOGIN_CREDENTIALS_QUESTION,
};
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::LoginConfig;

/// Labels of buttons that submit a login form
const SUBMIT_LABELS: &[&str] = &["log in", "login", "sign in", "signin", "submit", "continue", "next"];

/// Labels of links leading to a login form
const SIGN_IN_LABELS: &[&str] = &["log in", "login", "sign in", "signin"];

/// Labels of fields holding the username
const USERNAME_HINTS: &[&str] = &["user", "email", "login", "account", "e-mail"];

/// What the landing page says about authentication
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    /// The session is usable as is
    Authenticated,
    /// A login form on the target's own origin
    FormLogin,
    /// Redirected to a delegated identity provider
    Sso { host: String },
}

impl SessionStatus {
    pub fn requires_login(&self) -> bool {
        !matches!(self, SessionStatus::Authenticated)
    }
}

/// Result of the detect stage
#[derive(Debug, Clone, PartialEq)]
pub struct DetectOutcome {
    /// Auth configuration with a normalised type
    pub auth: AuthConfig,
    pub next: RunState,
    pub question: Option<Question>,
}

/// Result of a login attempt
#[derive(Debug, Clone, PartialEq)]
pub struct LoginAttempt {
    pub success: bool,
    pub landed_on: Option<String>,
    pub error: Option<String>,
}

/// Result of post-login validation
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationOutcome {
    pub authenticated: bool,
    pub reason: Option<String>,
    /// Markers that confirmed the session
    pub markers: Vec<String>,
}

pub struct LoginPipeline {
    config: LoginConfig,
}

impl LoginPipeline {
    pub fn new(config: LoginConfig) -> Self {
        Self { config }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Open the base URL and classify the landing page
    pub async fn session_check(
        &self,
        session: &dyn BrowserSession,
        base_url: &str,
        auth: &AuthConfig,
    ) -> Result<SessionStatus> {
        let page = session.navigate(base_url).await?;
        let snapshot = session.snapshot().await?;
        let status = self.classify(base_url, &page.url, &snapshot, auth);
        info!(landing = %page.url, status = ?status, "Session check complete");
        Ok(status)
    }

    fn classify(
        &self,
        base_url: &str,
        landed_url: &str,
        snapshot: &DomSnapshot,
        auth: &AuthConfig,
    ) -> SessionStatus {
        if let Some(host) = self.foreign_identity_host(base_url, landed_url) {
            return SessionStatus::Sso { host };
        }
        if snapshot.has_password_field {
            return SessionStatus::FormLogin;
        }
        if auth.auth_type == AuthType::None {
            return SessionStatus::Authenticated;
        }
        // The login form may sit behind a "Sign in" link
        match self.has_authenticated_marker(snapshot) {
            Some(marker) => {
                debug!(marker = %marker, "Session marker found on {}", landed_url);
                SessionStatus::Authenticated
            }
            None => {
                debug!("No login form and no session markers on {}", landed_url);
                SessionStatus::FormLogin
            }
        }
    }

    /// Host of the identity provider if the landing page is not the target's
    fn foreign_identity_host(&self, base_url: &str, landed_url: &str) -> Option<String> {
        let landed = Url::parse(landed_url).ok()?;
        let host = landed.host_str()?.to_lowercase();
        let known_idp = self
            .config
            .identity_provider_hosts
            .iter()
            .any(|idp| host.contains(&idp.to_lowercase()));
        let base_origin = Url::parse(base_url).ok().map(|u| u.origin());
        let foreign = base_origin.map(|o| o != landed.origin()).unwrap_or(false);
        if known_idp || foreign {
            Some(host)
        } else {
            None
        }
    }

    fn has_authenticated_marker(&self, snapshot: &DomSnapshot) -> Option<String> {
        self.config
            .authenticated_markers
            .iter()
            .find(|marker| {
                snapshot.mentions(marker)
                    || snapshot
                        .controls
                        .iter()
                        .any(|c| c.label.to_lowercase().contains(&marker.to_lowercase()))
            })
            .cloned()
    }

    /// Normalise the auth type and decide whether to ask for credentials.
    ///
    /// Total by construction: anything short of a complete username and
    /// password results in a question.
    pub fn detect(&self, auth: &AuthConfig, sso_detected: bool, attempt: u32) -> DetectOutcome {
        let mut auth = auth.clone();
        auth.auth_type = match (sso_detected, auth.auth_type) {
            (true, _) => AuthType::Sso,
            (false, AuthType::Sso) | (false, AuthType::None) => AuthType::Form,
            (false, other) => other,
        };

        if auth.has_credentials() {
            return DetectOutcome {
                auth,
                next: RunState::LoginAttempt,
                question: None,
            };
        }

        let question = credentials_question(&auth, attempt, None);
        DetectOutcome {
            auth,
            next: RunState::WaitLoginInput,
            question: Some(question),
        }
    }

    /// Drive the login form with the configured credentials
    pub async fn execute(
        &self,
        session: &dyn BrowserSession,
        base_url: &str,
        auth: &AuthConfig,
        step_timeout_ms: u64,
    ) -> Result<LoginAttempt> {
        let (username, password) = match (&auth.username, &auth.password) {
            (Some(u), Some(p)) => (u.clone(), p.clone()),
            _ => return Err(Error::Login("credentials are incomplete".to_string())),
        };

        session.navigate(base_url).await?;
        let mut snapshot = session.snapshot().await?;

        if !snapshot.has_password_field && username_field(&snapshot).is_none() {
            if let Some(href) = sign_in_link(&snapshot).and_then(|c| c.href.clone()) {
                debug!("Following sign-in link to {}", href);
                session.navigate(&href).await?;
                snapshot = session.snapshot().await?;
            }
        }

        // Identity providers often ask for the username on its own page first
        if !snapshot.has_password_field {
            let Some(user_field) = username_field(&snapshot) else {
                return Ok(LoginAttempt {
                    success: false,
                    landed_on: Some(snapshot.url),
                    error: Some("no login form found".to_string()),
                });
            };
            let mut steps = vec![BrowserAction::Fill {
                selector: user_field.selector.clone(),
                value: username.clone(),
            }];
            steps.extend(submit_action(&snapshot));
            if let Some(failure) = first_error(session.run_actions(&steps, step_timeout_ms).await?) {
                return Ok(LoginAttempt {
                    success: false,
                    landed_on: Some(snapshot.url),
                    error: Some(failure),
                });
            }
            snapshot = session.snapshot().await?;
            if !snapshot.has_password_field {
                return Ok(LoginAttempt {
                    success: false,
                    landed_on: Some(snapshot.url),
                    error: Some("password field never appeared".to_string()),
                });
            }
        }

        let mut steps = Vec::new();
        if let Some(user_field) = username_field(&snapshot) {
            steps.push(BrowserAction::Fill {
                selector: user_field.selector.clone(),
                value: username,
            });
        }
        let password_selector = snapshot
            .controls_of(ControlKind::PasswordInput)
            .next()
            .map(|c| c.selector.clone())
            .unwrap_or_else(|| "input[type=password]".to_string());
        steps.push(BrowserAction::Fill {
            selector: password_selector,
            value: password,
        });
        steps.extend(submit_action(&snapshot));
        steps.push(BrowserAction::Sleep { ms: 1000 });

        let outcomes = session.run_actions(&steps, step_timeout_ms).await?;
        let landed_on = session.current_url().await.ok();
        match first_error(outcomes) {
            Some(error) => {
                warn!("Login attempt failed: {}", error);
                Ok(LoginAttempt {
                    success: false,
                    landed_on,
                    error: Some(error),
                })
            }
            None => Ok(LoginAttempt {
                success: true,
                landed_on,
                error: None,
            }),
        }
    }

    /// Confirm the session is authenticated on the target itself
    pub async fn validate(&self, session: &dyn BrowserSession, base_url: &str) -> Result<ValidationOutcome> {
        let snapshot = session.snapshot().await?;
        let network = session.network_log().await?;
        Ok(self.assess(base_url, &snapshot, &network))
    }

    fn assess(&self, base_url: &str, snapshot: &DomSnapshot, network: &[NetworkExchange]) -> ValidationOutcome {
        let reject = |reason: String| ValidationOutcome {
            authenticated: false,
            reason: Some(reason),
            markers: Vec::new(),
        };

        if let Some(host) = self.foreign_identity_host(base_url, &snapshot.url) {
            return reject(format!("still on identity provider {}", host));
        }
        if snapshot.has_password_field {
            let detail = snapshot.validation_messages.first().cloned().unwrap_or_default();
            return reject(format!("login form is still displayed {}", detail).trim().to_string());
        }
        if let Some(bad) = network
            .iter()
            .find(|x| x.resource_type == "document" && x.status >= 400)
        {
            return reject(format!("document request returned {}", bad.status));
        }

        let markers: Vec<String> = self
            .config
            .authenticated_markers
            .iter()
            .filter(|m| {
                snapshot.mentions(m)
                    || snapshot
                        .controls
                        .iter()
                        .any(|c| c.label.to_lowercase().contains(&m.to_lowercase()))
            })
            .cloned()
            .collect();
        let has_nav = snapshot.controls_of(ControlKind::Nav).next().is_some();
        if markers.is_empty() && !has_nav {
            return reject("no authenticated-session markers on the page".to_string());
        }

        ValidationOutcome {
            authenticated: true,
            reason: None,
            markers,
        }
    }
}

/// The `login_creds` question; `reason` explains a previous rejection
pub fn credentials_question(auth: &AuthConfig, attempt: u32, reason: Option<&str>) -> Question {
    let mut prompt = match auth.auth_type {
        AuthType::Sso => "Single sign-on detected. Enter the identity provider credentials as username,password".to_string(),
        _ => "Enter login credentials as username,password".to_string(),
    };
    if let Some(reason) = reason {
        prompt = format!("Login was not confirmed ({}). {}", reason, prompt);
    }
    Question {
        id: LOGIN_CREDENTIALS_QUESTION.to_string(),
        input_type: InputType::Credentials,
        prompt,
        options: Vec::new(),
        context: Some(json!({
            "mechanism": auth.auth_type,
            "attempt": attempt,
            "reason": reason,
        })),
    }
}

/// Parse `username,password` or `{"username": .., "password": ..}`
pub fn parse_credentials_answer(payload: &Value) -> Result<(String, String)> {
    let reject = |msg: &str| Error::AnswerRejected(msg.to_string());

    let (username, password) = match payload {
        Value::String(text) => {
            let text = text.trim();
            if text.starts_with('{') {
                let parsed: Value = serde_json::from_str(text)
                    .map_err(|_| reject("credentials must be username,password"))?;
                return parse_credentials_answer(&parsed);
            }
            let (user, pass) = text
                .split_once(',')
                .ok_or_else(|| reject("credentials must be username,password"))?;
            (user.trim().to_string(), pass.to_string())
        }
        Value::Object(map) => {
            let field = |name: &str| map.get(name).and_then(|v| v.as_str()).map(str::to_string);
            (
                field("username").unwrap_or_default().trim().to_string(),
                field("password").unwrap_or_default(),
            )
        }
        _ => return Err(reject("credentials must be username,password")),
    };

    if username.is_empty() || password.is_empty() {
        return Err(reject("username and password are both required"));
    }
    Ok((username, password))
}

fn username_field(snapshot: &DomSnapshot) -> Option<&Control> {
    let mut inputs = snapshot.controls_of(ControlKind::TextInput).peekable();
    let first = inputs.peek().copied();
    snapshot
        .controls_of(ControlKind::TextInput)
        .find(|c| {
            let label = c.label.to_lowercase();
            USERNAME_HINTS.iter().any(|h| label.contains(h))
        })
        .or(first)
}

fn sign_in_link(snapshot: &DomSnapshot) -> Option<&Control> {
    snapshot.controls_of(ControlKind::Link).find(|c| {
        let label = c.label.trim().to_lowercase();
        SIGN_IN_LABELS.iter().any(|l| label == *l)
    })
}

fn submit_action(snapshot: &DomSnapshot) -> Option<BrowserAction> {
    let button = snapshot.controls_of(ControlKind::Button).find(|c| {
        let label = c.label.trim().to_lowercase();
        SUBMIT_LABELS.iter().any(|l| label == *l || label.starts_with(l))
    });
    match button {
        Some(button) => Some(BrowserAction::Click {
            selector: button.selector.clone(),
            timeout_ms: None,
        }),
        None if snapshot.controls_of(ControlKind::Form).next().is_some() => Some(BrowserAction::Press {
            selector: None,
            key: "Enter".to_string(),
        }),
        None => snapshot.controls_of(ControlKind::Button).next().map(|b| BrowserAction::Click {
            selector: b.selector.clone(),
            timeout_ms: None,
        }),
    }
}

fn first_error(outcomes: Vec<qaflow_browser::ActionOutcome>) -> Option<String> {
    outcomes
        .into_iter()
        .find(|o| !o.success)
        .map(|o| format!("{}: {}", o.label, o.error.unwrap_or_default()))
}
