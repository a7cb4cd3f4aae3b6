//! Worker process lifecycle: resolve, spawn, observe, kill.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tsbridge_types::InstanceId;

use crate::cancellation::{NoopCanceller, PipeCanceller, RequestCanceller};
use crate::config::{BridgeConfig, ServerMode, WorkerConfig, WorkerLogConfig};

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("{name} not found: {source}")]
    NotFound { name: String, source: which::Error },
    #[error("worker script {} does not exist", .0.display())]
    ScriptMissing(PathBuf),
    #[error("failed to spawn {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        source: std::io::Error,
    },
    #[error("worker process has no {0} pipe")]
    MissingPipe(&'static str),
}

/// Events observed about a worker process, tagged with the instance that
/// produced them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SupervisorEvent {
    StdErr {
        instance: InstanceId,
        line: String,
    },
    Exited {
        instance: InstanceId,
        code: Option<i32>,
        signal: Option<i32>,
    },
    /// Unrecoverable transport or protocol failure; the facade kills the
    /// instance in response.
    Fatal {
        instance: InstanceId,
        command: Option<String>,
        error: String,
    },
}

impl SupervisorEvent {
    pub fn instance(&self) -> InstanceId {
        match self {
            Self::StdErr { instance, .. }
            | Self::Exited { instance, .. }
            | Self::Fatal { instance, .. } => *instance,
        }
    }
}

pub(crate) type SupervisorSender = mpsc::UnboundedSender<SupervisorEvent>;

/// Program and argument list for one worker launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

fn is_script(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("js") || ext.eq_ignore_ascii_case("cjs"))
}

fn resolve(program: &Path) -> Result<PathBuf, SpawnError> {
    which::which(program).map_err(|source| SpawnError::NotFound {
        name: program.display().to_string(),
        source,
    })
}

/// Worker flags, independent of how the worker is launched.
fn worker_flags(
    config: &WorkerConfig,
    logging: &WorkerLogConfig,
    log_file: Option<&Path>,
    cancellation_pipe: Option<&str>,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = Vec::new();

    if config.server_mode != ServerMode::Semantic {
        args.push("--serverMode".into());
        args.push(config.server_mode.as_str().into());
    }
    if let Some(locale) = &config.locale {
        args.push("--locale".into());
        args.push(locale.into());
    }
    if !config.plugins.is_empty() {
        let names: Vec<&str> = config.plugins.iter().map(|p| p.name.as_str()).collect();
        args.push("--globalPlugins".into());
        args.push(names.join(",").into());

        let locations: Vec<String> = config
            .plugins
            .iter()
            .filter_map(|p| p.location.as_ref())
            .map(|l| l.display().to_string())
            .collect();
        if !locations.is_empty() {
            args.push("--pluginProbeLocations".into());
            args.push(locations.join(",").into());
        }
    }
    if let Some(log_file) = log_file {
        args.push("--logVerbosity".into());
        args.push(logging.verbosity.as_str().into());
        args.push("--logFile".into());
        args.push(log_file.into());
    }
    if let Some(pipe) = cancellation_pipe {
        args.push("--cancellationPipeName".into());
        args.push(pipe.into());
    }
    // Background-update diagnostics are re-pulled by the bridge itself.
    args.push("--noGetErrOnBackgroundUpdate".into());
    args.extend(config.extra_args.iter().map(OsString::from));
    args
}

pub(crate) fn build_command(
    config: &WorkerConfig,
    logging: &WorkerLogConfig,
    log_file: Option<&Path>,
    cancellation_pipe: Option<&str>,
) -> Result<WorkerCommand, SpawnError> {
    let flags = worker_flags(config, logging, log_file, cancellation_pipe);

    if is_script(&config.tsserver_path) || config.node_path.is_some() {
        let node = config
            .node_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("node"));
        let program = resolve(&node)?;
        if !config.tsserver_path.exists() {
            return Err(SpawnError::ScriptMissing(config.tsserver_path.clone()));
        }

        let mut args: Vec<OsString> = Vec::new();
        if let Some(mb) = config.max_memory_mb {
            args.push(format!("--max-old-space-size={mb}").into());
        }
        args.push(config.tsserver_path.clone().into_os_string());
        args.extend(flags);
        return Ok(WorkerCommand { program, args });
    }

    Ok(WorkerCommand {
        program: resolve(&config.tsserver_path)?,
        args: flags,
    })
}

/// Fresh log directory for one instance. Failure degrades to no worker log.
fn create_log_directory(root: &Path) -> Option<PathBuf> {
    let created = std::fs::create_dir_all(root).and_then(|()| {
        tempfile::Builder::new()
            .prefix("tsserver-log-")
            .keep(true)
            .tempdir_in(root)
    });
    match created {
        Ok(dir) => Some(dir.path().to_path_buf()),
        Err(e) => {
            tracing::warn!(root = %root.display(), "could not create worker log directory: {e}");
            None
        }
    }
}

fn make_canceller(enabled: bool) -> (Arc<dyn RequestCanceller>, Option<String>) {
    if !enabled {
        return (Arc::new(NoopCanceller), None);
    }
    match PipeCanceller::new() {
        Ok(pipe) => {
            let arg = pipe.pipe_name_arg();
            let canceller: Arc<dyn RequestCanceller> = Arc::new(pipe);
            (canceller, Some(arg))
        }
        Err(e) => {
            tracing::warn!("cancellation channel unavailable, cancelling locally only: {e}");
            (Arc::new(NoopCanceller), None)
        }
    }
}

/// Kill switch and exit signal for one worker process.
#[derive(Debug, Clone)]
pub(crate) struct WorkerHandle {
    kill: CancellationToken,
    exited: CancellationToken,
    pid: Option<u32>,
}

impl WorkerHandle {
    /// Request termination. Unconditional and idempotent.
    pub fn kill(&self) {
        self.kill.cancel();
    }

    pub fn has_exited(&self) -> bool {
        self.exited.is_cancelled()
    }

    /// `true` if the process exited within `timeout`.
    pub async fn wait_for_exit(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.exited.cancelled())
            .await
            .is_ok()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

pub(crate) struct SpawnedWorker {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub canceller: Arc<dyn RequestCanceller>,
    pub log_file: Option<PathBuf>,
    pub handle: WorkerHandle,
}

/// Spawn one worker instance and start observing it.
///
/// Must be called from within a tokio runtime.
pub(crate) fn spawn(
    config: &BridgeConfig,
    instance: InstanceId,
    events: SupervisorSender,
) -> Result<SpawnedWorker, SpawnError> {
    // Resolve first so an impossible spawn has no side effects.
    build_command(&config.worker, &config.logging, None, None)?;

    let log_file = if config.logging.enabled() {
        create_log_directory(&config.logging.root()).map(|dir| dir.join("tsserver.log"))
    } else {
        None
    };
    let (canceller, pipe_arg) = make_canceller(config.worker.cancellation);
    let command = build_command(
        &config.worker,
        &config.logging,
        log_file.as_deref(),
        pipe_arg.as_deref(),
    )?;

    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &config.worker.working_directory {
        cmd.current_dir(dir);
    }

    let mut child = cmd.spawn().map_err(|source| SpawnError::Spawn {
        program: command.program.clone(),
        source,
    })?;

    let stdin = child.stdin.take().ok_or(SpawnError::MissingPipe("stdin"))?;
    let stdout = child.stdout.take().ok_or(SpawnError::MissingPipe("stdout"))?;
    let stderr = child.stderr.take().ok_or(SpawnError::MissingPipe("stderr"))?;
    let pid = child.id();

    tracing::info!(
        %instance,
        pid,
        program = %command.program.display(),
        log_file = ?log_file,
        "worker started"
    );

    tokio::spawn(pump_stderr(stderr, instance, events.clone()));

    let handle = WorkerHandle {
        kill: CancellationToken::new(),
        exited: CancellationToken::new(),
        pid,
    };
    let kill = handle.kill.clone();
    let exited = handle.exited.clone();
    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            () = kill.cancelled() => {
                tracing::debug!(%instance, "killing worker");
                if let Err(e) = child.start_kill() {
                    tracing::debug!(%instance, "kill failed: {e}");
                }
                child.wait().await
            }
        };
        let (code, signal) = match status {
            Ok(status) => exit_parts(status),
            Err(e) => {
                tracing::warn!(%instance, "waiting for worker failed: {e}");
                (None, None)
            }
        };
        tracing::info!(%instance, ?code, ?signal, "worker exited");
        exited.cancel();
        let _ = events.send(SupervisorEvent::Exited {
            instance,
            code,
            signal,
        });
    });

    Ok(SpawnedWorker {
        stdin,
        stdout,
        canceller,
        log_file,
        handle,
    })
}

async fn pump_stderr(stderr: ChildStderr, instance: InstanceId, events: SupervisorSender) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if events
                    .send(SupervisorEvent::StdErr { instance, line })
                    .is_err()
                {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(%instance, "worker stderr read failed: {e}");
                break;
            }
        }
    }
}

#[cfg(unix)]
fn exit_parts(status: ExitStatus) -> (Option<i32>, Option<i32>) {
    use std::os::unix::process::ExitStatusExt;
    (status.code(), status.signal())
}

#[cfg(not(unix))]
fn exit_parts(status: ExitStatus) -> (Option<i32>, Option<i32>) {
    (status.code(), None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LogVerbosity, PluginConfig};

    fn args_of(command: &WorkerCommand) -> Vec<String> {
        command
            .args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[cfg(unix)]
    fn direct_worker() -> WorkerConfig {
        WorkerConfig {
            tsserver_path: PathBuf::from("sh"),
            ..WorkerConfig::default()
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_direct_executable_gets_default_flags_only() {
        let command = build_command(
            &direct_worker(),
            &WorkerLogConfig::default(),
            None,
            None,
        )
        .unwrap();
        assert!(command.program.is_absolute());
        assert_eq!(args_of(&command), vec!["--noGetErrOnBackgroundUpdate"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_full_flag_set() {
        let config = WorkerConfig {
            server_mode: ServerMode::Syntactic,
            locale: Some("ja".to_string()),
            plugins: vec![
                PluginConfig {
                    name: "a".to_string(),
                    location: Some(PathBuf::from("/p1")),
                },
                PluginConfig {
                    name: "b".to_string(),
                    location: None,
                },
            ],
            extra_args: vec!["--disableAutomaticTypingAcquisition".to_string()],
            ..direct_worker()
        };
        let logging = WorkerLogConfig {
            verbosity: LogVerbosity::Verbose,
            directory: None,
        };
        let command = build_command(
            &config,
            &logging,
            Some(Path::new("/tmp/l/tsserver.log")),
            Some("/tmp/c/seq_*"),
        )
        .unwrap();
        assert_eq!(
            args_of(&command),
            vec![
                "--serverMode",
                "syntactic",
                "--locale",
                "ja",
                "--globalPlugins",
                "a,b",
                "--pluginProbeLocations",
                "/p1",
                "--logVerbosity",
                "verbose",
                "--logFile",
                "/tmp/l/tsserver.log",
                "--cancellationPipeName",
                "/tmp/c/seq_*",
                "--noGetErrOnBackgroundUpdate",
                "--disableAutomaticTypingAcquisition",
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_script_runs_under_node_with_memory_limit() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("tsserver.js");
        std::fs::write(&script, "").unwrap();
        let config = WorkerConfig {
            tsserver_path: script.clone(),
            // Any executable stands in for node here.
            node_path: Some(PathBuf::from("sh")),
            max_memory_mb: Some(4096),
            ..WorkerConfig::default()
        };
        let command = build_command(&config, &WorkerLogConfig::default(), None, None).unwrap();
        let args = args_of(&command);
        assert_eq!(args[0], "--max-old-space-size=4096");
        assert_eq!(args[1], script.display().to_string());
        assert_eq!(args[2], "--noGetErrOnBackgroundUpdate");
    }

    #[cfg(unix)]
    #[test]
    fn test_missing_script_is_error() {
        let config = WorkerConfig {
            tsserver_path: PathBuf::from("/definitely/not/here/tsserver.js"),
            node_path: Some(PathBuf::from("sh")),
            ..WorkerConfig::default()
        };
        assert!(matches!(
            build_command(&config, &WorkerLogConfig::default(), None, None),
            Err(SpawnError::ScriptMissing(_))
        ));
    }

    #[test]
    fn test_unresolvable_executable_is_error() {
        let config = WorkerConfig {
            tsserver_path: PathBuf::from("tsbridge-no-such-worker-binary"),
            ..WorkerConfig::default()
        };
        assert!(matches!(
            build_command(&config, &WorkerLogConfig::default(), None, None),
            Err(SpawnError::NotFound { .. })
        ));
    }

    #[test]
    fn test_log_directory_is_fresh_per_call() {
        let root = tempfile::tempdir().unwrap();
        let a = create_log_directory(root.path()).unwrap();
        let b = create_log_directory(root.path()).unwrap();
        assert_ne!(a, b);
        assert!(a.is_dir() && b.is_dir());
        assert!(a.starts_with(root.path()));
    }

    #[cfg(unix)]
    #[test]
    fn test_log_directory_failure_degrades() {
        let root = tempfile::tempdir().unwrap();
        let file = root.path().join("not-a-dir");
        std::fs::write(&file, "").unwrap();
        assert!(create_log_directory(&file).is_none());
    }

    #[cfg(unix)]
    fn script_worker(dir: &Path, body: &str) -> BridgeConfig {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("worker.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        BridgeConfig {
            worker: WorkerConfig {
                tsserver_path: path,
                ..WorkerConfig::default()
            },
            ..BridgeConfig::default()
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_reports_exit_with_signal() {
        let dir = tempfile::tempdir().unwrap();
        let config = script_worker(dir.path(), "exec sleep 30");
        let (tx, mut rx) = mpsc::unbounded_channel();

        let worker = spawn(&config, InstanceId::new(1), tx).unwrap();
        assert!(worker.handle.pid().is_some());
        worker.handle.kill();
        worker.handle.kill();
        assert!(worker.handle.wait_for_exit(Duration::from_secs(5)).await);
        assert!(worker.handle.has_exited());

        let event = rx.recv().await.unwrap();
        match event {
            SupervisorEvent::Exited {
                instance, code, signal,
            } => {
                assert_eq!(instance, InstanceId::new(1));
                assert_eq!(code, None);
                assert!(signal.is_some());
            }
            other => panic!("expected Exited, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stderr_lines_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let config = script_worker(dir.path(), "echo boom >&2\nexit 3");
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _worker = spawn(&config, InstanceId::new(4), tx).unwrap();

        let mut saw_stderr = false;
        let mut exit_code = None;
        while let Some(event) = rx.recv().await {
            assert_eq!(event.instance(), InstanceId::new(4));
            match event {
                SupervisorEvent::StdErr { line, .. } => {
                    assert_eq!(line, "boom");
                    saw_stderr = true;
                }
                SupervisorEvent::Exited { code, .. } => {
                    exit_code = code;
                    break;
                }
                SupervisorEvent::Fatal { .. } => panic!("unexpected fatal"),
            }
        }
        assert_eq!(exit_code, Some(3));
        // The stderr pump may lag behind the exit watcher.
        if !saw_stderr {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert!(matches!(event, SupervisorEvent::StdErr { line, .. } if line == "boom"));
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_with_logging_creates_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let logs = tempfile::tempdir().unwrap();
        let mut config = script_worker(dir.path(), "exec cat >/dev/null");
        config.logging = WorkerLogConfig {
            verbosity: LogVerbosity::Normal,
            directory: Some(logs.path().to_path_buf()),
        };
        let (tx, _rx) = mpsc::unbounded_channel();

        let worker = spawn(&config, InstanceId::new(1), tx).unwrap();
        let log_file = worker.log_file.clone().unwrap();
        assert!(log_file.starts_with(logs.path()));
        assert!(log_file.parent().unwrap().is_dir());
        worker.handle.kill();
        assert!(worker.handle.wait_for_exit(Duration::from_secs(5)).await);
    }
}
