//! Engine supervisor - sing-box child process lifecycle
//!
//! Spawns the engine binary (`<path> run -c <config>`), forwards its
//! stdout/stderr into the ring log, keeps a short stderr tail for error
//! reporting, and stops it gracefully (interrupt, then kill after a grace
//! period). At most one child is live at a time.

use super::logbuf::LogBuffer;
use super::{VpnError, VpnResult};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

/// Grace period between interrupt and kill.
const STOP_GRACE: Duration = Duration::from_secs(3);

/// Longest line the log forwarder will buffer.
const MAX_LINE_BYTES: usize = 1024 * 1024;

/// How many stderr lines to keep for readiness-gate error messages.
const STDERR_TAIL_LINES: usize = 20;

/// Where engine output goes, selected by `NEKKUS_SINGBOX_LOG`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogMode {
    Memory,
    Stdout,
    None,
}

impl LogMode {
    fn from_env() -> Self {
        match std::env::var("NEKKUS_SINGBOX_LOG")
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
            .as_str()
        {
            "stdout" => LogMode::Stdout,
            "none" | "off" | "false" | "0" => LogMode::None,
            _ => LogMode::Memory,
        }
    }
}

pub struct Supervisor {
    child: Mutex<Option<Child>>,
    last_error: Mutex<Option<String>>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            child: Mutex::new(None),
            last_error: Mutex::new(None),
            stderr_tail: Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES))),
        }
    }

    /// Spawn the engine. Any previous child is killed first.
    pub async fn start(
        &self,
        binary: &Path,
        config: &Path,
        logs: Arc<LogBuffer>,
    ) -> VpnResult<()> {
        self.stop().await;
        self.stderr_tail.lock().clear();

        let mut command = Command::new(binary);
        command
            .arg("run")
            .arg("-c")
            .arg(config)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(windows)]
        {
            // CREATE_NO_WINDOW: no console flash for the child.
            command.creation_flags(0x0800_0000);
        }

        let mut child = command.spawn().map_err(|e| {
            let msg = e.to_string();
            *self.last_error.lock() = Some(msg.clone());
            VpnError::EngineStartFailure(msg)
        })?;

        let mode = LogMode::from_env();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, mode, Arc::clone(&logs), None));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(
                stderr,
                mode,
                logs,
                Some(Arc::clone(&self.stderr_tail)),
            ));
        }

        info!("sing-box started: {} run -c {}", binary.display(), config.display());
        *self.last_error.lock() = None;
        *self.child.lock() = Some(child);
        Ok(())
    }

    /// Non-blocking exit probe. `Some` once the child has terminated.
    pub fn try_status(&self) -> Option<std::process::ExitStatus> {
        let mut guard = self.child.lock();
        let child = guard.as_mut()?;
        match child.try_wait() {
            Ok(status) => status,
            Err(e) => {
                warn!("child status probe failed: {e}");
                None
            }
        }
    }

    pub fn is_running(&self) -> bool {
        let mut guard = self.child.lock();
        match guard.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    /// Last stderr lines, joined, for surfacing spawn/startup failures.
    pub fn stderr_tail(&self) -> String {
        let tail = self.stderr_tail.lock();
        tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    /// Graceful stop: interrupt, wait up to the grace period, then kill.
    /// Always reaps. No-op when nothing is running.
    pub async fn stop(&self) {
        let mut child = match self.child.lock().take() {
            Some(child) => child,
            None => return,
        };

        if let Ok(Some(status)) = child.try_wait() {
            debug!("sing-box already exited: {status}");
            return;
        }

        interrupt(&child);

        match tokio::time::timeout(STOP_GRACE, child.wait()).await {
            Ok(Ok(status)) => debug!("sing-box exited: {status}"),
            Ok(Err(e)) => warn!("sing-box reap failed: {e}"),
            Err(_) => {
                warn!("sing-box ignored interrupt, killing");
                if let Err(e) = child.start_kill() {
                    warn!("kill failed: {e}");
                }
                if let Err(e) = child.wait().await {
                    warn!("reap after kill failed: {e}");
                }
            }
        }
        info!("sing-box stopped");
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
fn interrupt(child: &Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGINT);
        }
    }
}

#[cfg(not(unix))]
fn interrupt(_child: &Child) {
    // No portable interrupt on Windows; stop() falls through to kill
    // after the grace period.
}

/// Forward one pipe line-by-line into the ring log (or stdout / nowhere,
/// per log mode). Lines longer than the cap are truncated.
async fn forward_lines<R: AsyncRead + Unpin>(
    reader: R,
    mode: LogMode,
    logs: Arc<LogBuffer>,
    tail: Option<Arc<Mutex<VecDeque<String>>>>,
) {
    let mut reader = BufReader::with_capacity(64 * 1024, reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("engine log pipe closed: {e}");
                break;
            }
        }
        if buf.len() > MAX_LINE_BYTES {
            buf.truncate(MAX_LINE_BYTES);
        }
        let line = String::from_utf8_lossy(&buf)
            .trim_end_matches(['\r', '\n'])
            .to_string();
        if line.is_empty() {
            continue;
        }
        if let Some(tail) = &tail {
            let mut tail = tail.lock();
            if tail.len() >= STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line.clone());
        }
        match mode {
            LogMode::Memory => logs.push(line),
            LogMode::Stdout => println!("{line}"),
            LogMode::None => {}
        }
    }
}

/// On Windows, bind the daemon to a kill-on-close Job Object so an
/// uncontrolled parent death also tears down the engine child. No-op
/// elsewhere (the child dies with the session).
#[cfg(windows)]
pub fn ensure_children_reaped() {
    use windows_sys::Win32::System::JobObjects::{
        AssignProcessToJobObject, CreateJobObjectW, JobObjectExtendedLimitInformation,
        SetInformationJobObject, JOBOBJECT_EXTENDED_LIMIT_INFORMATION,
        JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE,
    };
    use windows_sys::Win32::System::Threading::GetCurrentProcess;

    unsafe {
        let job = CreateJobObjectW(std::ptr::null(), std::ptr::null());
        if job.is_null() {
            warn!("job object creation failed; children may outlive the daemon");
            return;
        }
        let mut info: JOBOBJECT_EXTENDED_LIMIT_INFORMATION = std::mem::zeroed();
        info.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;
        let ok = SetInformationJobObject(
            job,
            JobObjectExtendedLimitInformation,
            &info as *const _ as *const core::ffi::c_void,
            std::mem::size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32,
        );
        if ok == 0 {
            warn!("job object limit setup failed");
            return;
        }
        // Leak the handle intentionally: closing it would kill the job.
        AssignProcessToJobObject(job, GetCurrentProcess());
    }
}

#[cfg(not(windows))]
pub fn ensure_children_reaped() {}
