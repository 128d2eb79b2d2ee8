// In-memory sandbox backend for tests
use crate::engine::{SandboxBackend, SandboxHandle, WaitOutcome};
use crate::language::Runtime;
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tutor_common::config::SandboxLimits;

/// How a fake sandbox behaves for a given program
#[derive(Debug, Clone)]
pub enum Scripted {
    Exit { code: i64, stdout: String, stderr: String },
    /// Runs until the timeout, then reports `TimedOut` like a well-behaved backend
    Hang,
    /// Never returns from `wait`
    IgnoreTimeout,
    FailStart,
    FailWait,
}

impl Scripted {
    pub fn exit(code: i64, stdout: &str, stderr: &str) -> Self {
        Scripted::Exit {
            code,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        }
    }
}

type Script = dyn Fn(&str) -> Scripted + Send + Sync;

pub struct FakeBackend {
    script: Box<Script>,
    next_id: AtomicUsize,
    started: AtomicUsize,
    destroyed: AtomicUsize,
    live: Mutex<HashSet<String>>,
    pending: Mutex<HashMap<String, Scripted>>,
    sources: Mutex<Vec<String>>,
}

impl FakeBackend {
    /// `script` decides the outcome from the program source
    pub fn new(script: impl Fn(&str) -> Scripted + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            next_id: AtomicUsize::new(0),
            started: AtomicUsize::new(0),
            destroyed: AtomicUsize::new(0),
            live: Mutex::new(HashSet::new()),
            pending: Mutex::new(HashMap::new()),
            sources: Mutex::new(Vec::new()),
        })
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Every program source seen by `start`, in start order
    pub fn sources(&self) -> Vec<String> {
        self.sources.lock().unwrap().clone()
    }
}

#[async_trait]
impl SandboxBackend for FakeBackend {
    async fn start(
        &self,
        runtime: &Runtime,
        code_dir: &Path,
        _limits: &SandboxLimits,
    ) -> Result<SandboxHandle> {
        let source = std::fs::read_to_string(code_dir.join(&runtime.file_name))?;
        self.sources.lock().unwrap().push(source.clone());

        let scripted = (self.script)(&source);
        if matches!(scripted, Scripted::FailStart) {
            bail!("fake backend refused to start");
        }

        let id = format!("fake-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.started.fetch_add(1, Ordering::SeqCst);
        self.live.lock().unwrap().insert(id.clone());
        self.pending.lock().unwrap().insert(id.clone(), scripted);
        Ok(SandboxHandle { id })
    }

    async fn wait(&self, handle: &SandboxHandle, timeout: Duration, _limits: &SandboxLimits) -> Result<WaitOutcome> {
        let scripted = self
            .pending
            .lock()
            .unwrap()
            .get(&handle.id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown sandbox {}", handle.id))?;

        match scripted {
            Scripted::Exit { code, stdout, stderr } => Ok(WaitOutcome::Exited {
                exit_code: code,
                stdout,
                stderr,
            }),
            Scripted::Hang => {
                tokio::time::sleep(timeout).await;
                Ok(WaitOutcome::TimedOut)
            }
            Scripted::IgnoreTimeout => std::future::pending().await,
            Scripted::FailWait => Err(anyhow!("fake backend lost the sandbox")),
            Scripted::FailStart => unreachable!("FailStart never produces a handle"),
        }
    }

    async fn destroy(&self, handle: &SandboxHandle) -> Result<()> {
        self.pending.lock().unwrap().remove(&handle.id);
        if self.live.lock().unwrap().remove(&handle.id) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
