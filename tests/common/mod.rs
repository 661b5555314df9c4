//! Shared test doubles: a scripted transport that replays canned responses
//! and records every command it sees.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use plume::connection::{Command, ImapTransport, TransportFactory};
use plume::errors::{EngineError, EngineResult};
use plume::types::{Account, TokenSource};

pub fn account(id: &str) -> Account {
    Account {
        id: id.to_string(),
        imap_host: "imap.example.com".to_string(),
        imap_port: 993,
        use_ssl: true,
        use_tls: false,
        username: id.to_string(),
        oauth2_capable: true,
    }
}

pub struct StaticTokens;

#[async_trait]
impl TokenSource for StaticTokens {
    async fn access_token(&self, _account: &Account) -> EngineResult<String> {
        Ok("test-token".to_string())
    }
}

struct Step {
    result: Result<Vec<String>, EngineError>,
    delay: Option<Duration>,
}

/// Script and activity log shared between a factory and every transport it
/// creates, so reconnects keep consuming the same response queue.
#[derive(Default)]
pub struct Script {
    steps: Mutex<VecDeque<Step>>,
    pub commands: Mutex<Vec<String>>,
    pub connects: AtomicU32,
    pub auths: AtomicU32,
}

impl Script {
    pub fn push_ok(&self, lines: &[&str]) {
        self.push_step(Ok(lines.iter().map(|s| s.to_string()).collect()), None);
    }

    /// Response that arrives only after a delay, keeping the command (and the
    /// connection lock) in flight meanwhile.
    pub fn push_ok_delayed(&self, lines: &[&str], delay: Duration) {
        self.push_step(
            Ok(lines.iter().map(|s| s.to_string()).collect()),
            Some(delay),
        );
    }

    pub fn push_err(&self, err: EngineError) {
        self.push_step(Err(err), None);
    }

    fn push_step(&self, result: Result<Vec<String>, EngineError>, delay: Option<Duration>) {
        self.steps.lock().unwrap().push_back(Step { result, delay });
    }

    pub fn command_log(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

pub struct ScriptedFactory {
    pub script: Arc<Script>,
}

impl ScriptedFactory {
    pub fn new() -> (Self, Arc<Script>) {
        let script = Arc::new(Script::default());
        (
            Self {
                script: Arc::clone(&script),
            },
            script,
        )
    }
}

impl TransportFactory for ScriptedFactory {
    fn create(&self, _account: &Account) -> Box<dyn ImapTransport> {
        Box::new(ScriptedTransport {
            script: Arc::clone(&self.script),
        })
    }
}

struct ScriptedTransport {
    script: Arc<Script>,
}

#[async_trait]
impl ImapTransport for ScriptedTransport {
    async fn connect(&mut self) -> EngineResult<()> {
        self.script.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn authenticate(&mut self, _user: &str, _token: &str) -> EngineResult<()> {
        self.script.auths.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn execute(&mut self, command: &Command) -> EngineResult<Vec<String>> {
        self.script.commands.lock().unwrap().push(command.wire());
        let step = self.script.steps.lock().unwrap().pop_front();
        match step {
            Some(step) => {
                if let Some(delay) = step.delay {
                    tokio::time::sleep(delay).await;
                }
                step.result
            }
            None => Ok(Vec::new()),
        }
    }

    async fn disconnect(&mut self) {}
}
