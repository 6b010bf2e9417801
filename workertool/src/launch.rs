use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tracing::{debug, instrument};

use crate::Error;

/// The environment variable pointing to the worker jar.
pub const LAUNCH_ARTIFACT_ENV: &str = "JAVACD_JAR";

pub type WorkerReader = Box<dyn AsyncRead + Send + Unpin>;
pub type WorkerWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A started worker: where to read its events from, where to write
/// commands to, and the process, if it runs in one.
pub struct LaunchedWorker {
    pub reader: WorkerReader,
    pub writer: WorkerWriter,
    pub child: Option<Child>,
}

/// Knows how to start a worker.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// The command line the worker is started with, for diagnostics.
    fn command_line(&self) -> Vec<String>;

    async fn launch(&self) -> Result<LaunchedWorker, Error>;
}

/// The argument vector a worker process is started with.
///
/// It's resolved once on construction, launching the same command many
/// times doesn't look at the environment again.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchCommand {
    argv: Vec<String>,
}

impl LaunchCommand {
    /// Runs `jar` with the java launcher, e.g. `["java", "-Xmx1g"]`.
    pub fn java(launcher: Vec<String>, jar: impl Into<String>) -> Result<Self, Error> {
        if launcher.is_empty() {
            return Err(Error::EmptyLaunchCommand);
        }

        let mut argv = launcher;
        argv.extend([
            "-Dfile.encoding=UTF-8".to_string(),
            "-jar".to_string(),
            jar.into(),
        ]);

        Ok(Self { argv })
    }

    /// Like [LaunchCommand::java], with the jar taken from [LAUNCH_ARTIFACT_ENV].
    pub fn java_from_env(launcher: Vec<String>) -> Result<Self, Error> {
        Self::java_from_lookup(launcher, |key| std::env::var(key).ok())
    }

    fn java_from_lookup(
        launcher: Vec<String>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, Error> {
        let jar = lookup(LAUNCH_ARTIFACT_ENV)
            .filter(|jar| !jar.is_empty())
            .ok_or(Error::LaunchArtifactUnset(LAUNCH_ARTIFACT_ENV))?;

        Self::java(launcher, jar)
    }

    /// Runs an arbitrary program speaking the worker protocol.
    pub fn custom(argv: Vec<String>) -> Result<Self, Error> {
        if argv.is_empty() {
            return Err(Error::EmptyLaunchCommand);
        }
        Ok(Self { argv })
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }
}

#[async_trait]
impl WorkerLauncher for LaunchCommand {
    fn command_line(&self) -> Vec<String> {
        self.argv.clone()
    }

    #[instrument(skip_all, fields(program = %self.argv[0]), err)]
    async fn launch(&self) -> Result<LaunchedWorker, Error> {
        let mut child = Command::new(&self.argv[0])
            .args(&self.argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(Error::Launch)?;

        let missing_pipe = || Error::Launch(std::io::Error::other("missing stdio pipe"));
        let writer = child.stdin.take().ok_or_else(missing_pipe)?;
        let reader = child.stdout.take().ok_or_else(missing_pipe)?;

        debug!(pid = child.id(), "worker launched");

        Ok(LaunchedWorker {
            reader: Box::new(reader),
            writer: Box::new(writer),
            child: Some(child),
        })
    }
}
