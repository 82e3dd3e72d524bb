//! In-memory transport used by tests.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{check, CommandOutput, Executor, RemoteCommand};
use crate::error::{Result, RiggerError};

struct Rule {
    pattern: String,
    output: CommandOutput,
}

#[derive(Default)]
struct State {
    files: BTreeMap<String, (String, u32)>,
    rules: Vec<Rule>,
    log: Vec<String>,
}

/// Every command exits 0 with empty output unless a rule matches it. The
/// most recently added matching rule wins. File primitives act on an
/// in-memory filesystem; a failing rule matching `mv -f <from> <to>` makes
/// `rename` fail. Commands run as another account are logged with an
/// `[as <user>]` prefix.
pub struct MockExecutor {
    host: String,
    state: Mutex<State>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self {
            host: "mock-host".to_string(),
            state: Mutex::new(State::default()),
        }
    }

    pub fn on(&self, pattern: &str, exit_code: i32, stdout: &str, stderr: &str) {
        self.state.lock().unwrap().rules.push(Rule {
            pattern: pattern.to_string(),
            output: CommandOutput {
                exit_code,
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            },
        });
    }

    pub fn respond(&self, pattern: &str, stdout: &str) {
        self.on(pattern, 0, stdout, "");
    }

    pub fn fail(&self, pattern: &str, stderr: &str) {
        self.on(pattern, 1, "", stderr);
    }

    pub fn seed_file(&self, path: &str, content: &str) {
        self.state
            .lock()
            .unwrap()
            .files
            .insert(path.to_string(), (content.to_string(), 0o644));
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.state.lock().unwrap().files.get(path).map(|(c, _)| c.clone())
    }

    pub fn mode(&self, path: &str) -> Option<u32> {
        self.state.lock().unwrap().files.get(path).map(|(_, m)| *m)
    }

    pub fn paths(&self) -> Vec<String> {
        self.state.lock().unwrap().files.keys().cloned().collect()
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn ran(&self, pattern: &str) -> bool {
        self.commands().iter().any(|c| c.contains(pattern))
    }

    /// Index of the first logged command containing `pattern`.
    pub fn position(&self, pattern: &str) -> Option<usize> {
        self.commands().iter().position(|c| c.contains(pattern))
    }
}

impl Default for MockExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for MockExecutor {
    fn host(&self) -> &str {
        &self.host
    }

    async fn run(&self, cmd: &RemoteCommand) -> Result<CommandOutput> {
        let output = {
            let mut state = self.state.lock().unwrap();
            state.log.push(match &cmd.run_as {
                Some(user) if !cmd.elevate => format!("[as {}] {}", user, cmd.script),
                _ => cmd.script.clone(),
            });
            state
                .rules
                .iter()
                .rev()
                .find(|r| cmd.script.contains(&r.pattern))
                .map(|r| r.output.clone())
                .unwrap_or_default()
        };
        check(&self.host, cmd, output)
    }

    async fn path_exists(&self, path: &str) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        state.log.push(format!("test -e {}", path));
        let prefix = format!("{}/", path.trim_end_matches('/'));
        Ok(state.files.contains_key(path) || state.files.keys().any(|k| k.starts_with(&prefix)))
    }

    async fn write_file(&self, path: &str, content: &str, mode: u32, _elevate: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.log.push(format!("write {}", path));
        state
            .files
            .insert(path.to_string(), (content.to_string(), mode));
        Ok(())
    }

    async fn read_file(&self, path: &str, _elevate: bool) -> Result<Option<String>> {
        let mut state = self.state.lock().unwrap();
        state.log.push(format!("read {}", path));
        Ok(state.files.get(path).map(|(c, _)| c.clone()))
    }

    async fn rename(&self, from: &str, to: &str, _elevate: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.log.push(format!("mv {} {}", from, to));
        let script = format!("mv -f {} {}", from, to);
        if let Some(rule) = state
            .rules
            .iter()
            .rev()
            .find(|r| script.contains(&r.pattern) && r.output.exit_code != 0)
        {
            return Err(RiggerError::Command {
                host: self.host.clone(),
                command: script,
                exit_code: rule.output.exit_code,
                stderr: rule.output.stderr.clone(),
            });
        }
        let entry = state.files.remove(from).ok_or_else(|| RiggerError::Command {
            host: self.host.clone(),
            command: format!("mv -f {} {}", from, to),
            exit_code: 1,
            stderr: format!("mv: cannot stat '{}': No such file or directory", from),
        })?;
        state.files.insert(to.to_string(), entry);
        Ok(())
    }

    async fn copy_file(&self, from: &str, to: &str, _elevate: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.log.push(format!("cp {} {}", from, to));
        if let Some(entry) = state.files.get(from).cloned() {
            state.files.insert(to.to_string(), entry);
        }
        Ok(())
    }

    async fn remove_file(&self, path: &str, _elevate: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.log.push(format!("rm {}", path));
        state.files.remove(path);
        Ok(())
    }
}
