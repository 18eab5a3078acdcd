//! Shared fixtures for unit tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use common::Secret;
use portal::{ErrorKind, IssuedToken, LoginPortal, PortalError};
use stores::Credential;

pub fn credential(id: u64, site: &str, account: &str) -> Credential {
    Credential {
        id,
        site: site.into(),
        account: account.into(),
        secret: Secret::new(format!("pw-{id}")),
        is_preferred: false,
        last_success_at: None,
        success_count: 0,
        failure_count: 0,
    }
}

/// Portal that replays a script of outcomes, then keeps returning `fallback`.
pub struct ScriptedPortal {
    script: Mutex<VecDeque<portal::Result<IssuedToken>>>,
    fallback: portal::Result<IssuedToken>,
    delay: Duration,
    calls: AtomicUsize,
}

impl ScriptedPortal {
    /// Always succeeds with `token`.
    pub fn issuing(token: &str) -> Self {
        Self::scripted(Vec::new(), Ok(issued(token)))
    }

    /// Always fails with `kind`.
    pub fn failing(kind: ErrorKind) -> Self {
        Self::scripted(Vec::new(), Err(PortalError::new(kind, "scripted failure")))
    }

    pub fn scripted(
        script: Vec<portal::Result<IssuedToken>>,
        fallback: portal::Result<IssuedToken>,
    ) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    /// Block each login for `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl LoginPortal for ScriptedPortal {
    fn id(&self) -> &str {
        "scripted"
    }

    fn login(&self, _account: &str, _secret: &Secret<String>) -> portal::Result<IssuedToken> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

pub fn issued(token: &str) -> IssuedToken {
    IssuedToken {
        token: token.into(),
        expires_at: None,
    }
}

pub fn portal_error(kind: ErrorKind) -> PortalError {
    PortalError::new(kind, format!("scripted {kind}"))
}
