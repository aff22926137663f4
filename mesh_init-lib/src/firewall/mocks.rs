#![cfg(test)]

use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Output};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::executor::CommandRunner;

#[derive(Default)]
struct RunnerState {
    invocations: Vec<String>,
    stdout_by_invocation: HashMap<String, String>,
    fail_on: Vec<String>,
}

/// Records every invocation and serves canned output, keyed by the rendered
/// invocation string. Invocations matching a registered failure needle exit
/// non-zero.
#[derive(Clone, Default)]
pub struct MockRunner {
    state: Arc<Mutex<RunnerState>>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_stdout(&self, invocation: &str, stdout: &str) {
        self.state
            .lock()
            .unwrap()
            .stdout_by_invocation
            .insert(invocation.to_string(), stdout.to_string());
    }

    pub fn fail_on(&self, needle: &str) {
        self.state.lock().unwrap().fail_on.push(needle.to_string());
    }

    pub fn invocations(&self) -> Vec<String> {
        self.state.lock().unwrap().invocations.clone()
    }
}

#[async_trait]
impl CommandRunner for MockRunner {
    async fn output(&self, program: &str, args: &[String]) -> std::io::Result<Output> {
        let mut invocation = program.to_string();
        if !args.is_empty() {
            invocation.push(' ');
            invocation.push_str(&args.join(" "));
        }
        let mut state = self.state.lock().unwrap();
        state.invocations.push(invocation.clone());

        let stdout = state
            .stdout_by_invocation
            .get(&invocation)
            .cloned()
            .unwrap_or_default();
        let failed = state.fail_on.iter().any(|needle| invocation.contains(needle));
        // Unix wait status: exit code lives in bits 8..16.
        let status = ExitStatus::from_raw(if failed { 1 << 8 } else { 0 });
        Ok(Output {
            status,
            stdout: stdout.into_bytes(),
            stderr: Vec::new(),
        })
    }
}
