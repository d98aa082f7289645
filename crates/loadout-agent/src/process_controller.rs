use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use tokio::{process::Command, sync::watch};

const FOREIGN_POLL_INTERVAL: Duration = Duration::from_millis(250);
pub(crate) const KILL_CONFIRM_WINDOW: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("executable not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("failed to launch {}: {source}", .path.display())]
    LaunchFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Exited after the polite request.
    Stopped,
    /// Did not exit within the graceful window and was killed.
    Forced,
    /// Was not running when the stop was requested.
    AlreadyGone,
}

impl StopOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            StopOutcome::Stopped => "stopped",
            StopOutcome::Forced => "killed after graceful timeout",
            StopOutcome::AlreadyGone => "not running",
        }
    }
}

/// Exit code of a finished process; `None` when it was ended by a signal or
/// the process was not our child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCode(pub Option<i32>);

/// Reference to an OS process.
///
/// Processes spawned by [`ProcessController::start_process`] carry an exit
/// watch fed by a reaper task; processes discovered by name are polled.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: u32,
    name: String,
    owned: bool,
    exit: Option<watch::Receiver<Option<ExitCode>>>,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `true` when this process was spawned by us (in its own process group).
    pub fn is_owned(&self) -> bool {
        self.owned
    }

    pub fn has_exited(&self) -> bool {
        match &self.exit {
            Some(rx) => rx.borrow().is_some(),
            None => !pid_is_alive(self.pid),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ProcessController;

impl ProcessController {
    pub fn new() -> Self {
        Self
    }

    /// Spawns `path` with `args`, detached into its own session.
    ///
    /// A path with a directory component must exist; a bare name is looked up
    /// on `PATH`.
    pub fn start_process(
        &self,
        path: &Path,
        args: &[String],
        cwd: Option<&Path>,
    ) -> Result<ProcessHandle, ProcessError> {
        let exe = resolve_executable(path).ok_or_else(|| ProcessError::NotFound(path.into()))?;

        let mut cmd = Command::new(&exe);
        cmd.args(args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        #[cfg(unix)]
        {
            // Own session: a Ctrl-C on our terminal must not reach the game or
            // the companions, and stop can signal the whole group.
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd.spawn().map_err(|source| ProcessError::LaunchFailed {
            path: exe.clone(),
            source,
        })?;
        let pid = child.id().unwrap_or(0);
        let name = exe
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| exe.display().to_string());

        let (tx, rx) = watch::channel(None);
        tokio::spawn(async move {
            let code = child.wait().await.ok().and_then(|s| s.code());
            let _ = tx.send(Some(ExitCode(code)));
        });

        tracing::debug!(pid, exe = %exe.display(), "process started");
        Ok(ProcessHandle {
            pid,
            name,
            owned: true,
            exit: Some(rx),
        })
    }

    /// Looks for a running process whose executable name matches `pattern`.
    ///
    /// Matching is case-insensitive, ignores a trailing `.exe`, and accepts
    /// glob wildcards. Not finding anything is a normal result.
    pub fn find_running(&self, pattern: &str) -> Option<ProcessHandle> {
        let matcher = NameMatcher::new(pattern)?;
        let me = std::process::id();
        list_processes()
            .into_iter()
            .filter(|p| p.pid != me)
            .find(|p| p.names.iter().any(|n| matcher.matches(n)))
            .map(|p| ProcessHandle {
                pid: p.pid,
                name: p.names.into_iter().next().unwrap_or_default(),
                owned: false,
                exit: None,
            })
    }

    /// Polls [`Self::find_running`] until a match appears or `timeout` passes.
    pub async fn wait_for_process(&self, pattern: &str, timeout: Duration) -> Option<ProcessHandle> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(h) = self.find_running(pattern) {
                return Some(h);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    /// Politely asks the process to exit, then kills it once `graceful` elapses.
    pub async fn request_stop(&self, handle: &ProcessHandle, graceful: Duration) -> StopOutcome {
        if handle.has_exited() {
            return StopOutcome::AlreadyGone;
        }

        if !send_terminate(handle) {
            // Raced with the exit, or the pid is gone.
            if handle.has_exited() {
                return StopOutcome::AlreadyGone;
            }
        }
        tracing::debug!(pid = handle.pid, name = %handle.name, "sent graceful stop");

        if wait_exit_within(handle, graceful).await {
            return StopOutcome::Stopped;
        }

        send_kill(handle);
        tracing::debug!(pid = handle.pid, name = %handle.name, "escalated to kill");
        let _ = wait_exit_within(handle, KILL_CONFIRM_WINDOW).await;
        StopOutcome::Forced
    }

    /// Suspends until the process exits, with no timeout;
    /// run it on its own task and drop/abort it to stop waiting.
    pub async fn wait_for_exit(&self, handle: &ProcessHandle) -> ExitCode {
        match &handle.exit {
            Some(rx) => {
                let mut rx = rx.clone();
                let code = match rx.wait_for(Option::is_some).await {
                    Ok(v) => *v,
                    Err(_) => None,
                };
                code.unwrap_or(ExitCode(None))
            }
            None => {
                while pid_is_alive(handle.pid) {
                    tokio::time::sleep(FOREIGN_POLL_INTERVAL).await;
                }
                ExitCode(None)
            }
        }
    }
}

async fn wait_exit_within(handle: &ProcessHandle, window: Duration) -> bool {
    match &handle.exit {
        Some(rx) => {
            let mut rx = rx.clone();
            matches!(
                tokio::time::timeout(window, rx.wait_for(Option::is_some)).await,
                Ok(Ok(_))
            )
        }
        None => {
            let deadline = tokio::time::Instant::now() + window;
            loop {
                if !pid_is_alive(handle.pid) {
                    return true;
                }
                if tokio::time::Instant::now() >= deadline {
                    return false;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

fn resolve_executable(path: &Path) -> Option<PathBuf> {
    let has_dir = path.is_absolute() || path.components().count() > 1;
    if has_dir {
        return path.is_file().then(|| path.to_path_buf());
    }

    let search = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&search) {
        let candidate = dir.join(path);
        if candidate.is_file() {
            return Some(candidate);
        }
        #[cfg(windows)]
        {
            let with_ext = candidate.with_extension("exe");
            if with_ext.is_file() {
                return Some(with_ext);
            }
        }
    }
    None
}

struct NameMatcher {
    exact: Option<String>,
    glob: Option<glob::Pattern>,
}

impl NameMatcher {
    fn new(pattern: &str) -> Option<Self> {
        let p = normalize_name(pattern);
        if p.is_empty() {
            return None;
        }
        if p.contains(['*', '?', '[']) {
            let glob = glob::Pattern::new(&p).ok()?;
            return Some(Self {
                exact: None,
                glob: Some(glob),
            });
        }
        Some(Self {
            exact: Some(p),
            glob: None,
        })
    }

    fn matches(&self, name: &str) -> bool {
        let name = normalize_name(name);
        if let Some(exact) = &self.exact {
            return *exact == name;
        }
        self.glob.as_ref().is_some_and(|g| g.matches(&name))
    }
}

fn normalize_name(name: &str) -> String {
    let lower = name.trim().to_ascii_lowercase();
    match lower.strip_suffix(".exe") {
        Some(stem) => stem.to_string(),
        None => lower,
    }
}

struct RunningProcess {
    pid: u32,
    names: Vec<String>,
}

#[cfg(target_os = "linux")]
fn list_processes() -> Vec<RunningProcess> {
    let Ok(dir) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for entry in dir.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        let mut names = Vec::new();
        // `comm` is truncated to 15 bytes, so also look at argv[0].
        if let Ok(cmdline) = std::fs::read(entry.path().join("cmdline"))
            && let Some(argv0) = cmdline.split(|b| *b == 0).next()
            && !argv0.is_empty()
        {
            let argv0 = String::from_utf8_lossy(argv0);
            if let Some(base) = Path::new(argv0.as_ref()).file_name() {
                names.push(base.to_string_lossy().into_owned());
            }
        }
        if let Ok(comm) = std::fs::read_to_string(entry.path().join("comm")) {
            let comm = comm.trim();
            if !comm.is_empty() {
                names.push(comm.to_string());
            }
        }
        if !names.is_empty() {
            out.push(RunningProcess { pid, names });
        }
    }
    out
}

#[cfg(all(unix, not(target_os = "linux")))]
fn list_processes() -> Vec<RunningProcess> {
    let Ok(out) = std::process::Command::new("ps").args(["-axo", "pid=,comm="]).output() else {
        return Vec::new();
    };
    String::from_utf8_lossy(&out.stdout)
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let (pid, comm) = line.split_once(char::is_whitespace)?;
            let pid = pid.parse().ok()?;
            let base = Path::new(comm.trim()).file_name()?.to_string_lossy().into_owned();
            Some(RunningProcess {
                pid,
                names: vec![base],
            })
        })
        .collect()
}

#[cfg(windows)]
fn list_processes() -> Vec<RunningProcess> {
    let Ok(out) = std::process::Command::new("tasklist")
        .args(["/FO", "CSV", "/NH"])
        .output()
    else {
        return Vec::new();
    };
    parse_tasklist(&String::from_utf8_lossy(&out.stdout))
}

#[cfg(any(test, windows))]
fn parse_tasklist(output: &str) -> Vec<RunningProcess> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if !line.starts_with('"') {
                return None;
            }
            let mut fields = line.trim_matches('"').split("\",\"");
            let name = fields.next()?.trim().to_string();
            let pid = fields.next()?.trim().parse().ok()?;
            Some(RunningProcess {
                pid,
                names: vec![name],
            })
        })
        .collect()
}

#[cfg(unix)]
pub(crate) fn pid_is_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return !is_zombie(pid);
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    stat.rfind(')')
        .and_then(|end| stat.get(end + 2..))
        .is_some_and(|rest| rest.starts_with('Z'))
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_zombie(_pid: u32) -> bool {
    false
}

#[cfg(windows)]
pub(crate) fn pid_is_alive(pid: u32) -> bool {
    let filter = format!("PID eq {pid}");
    std::process::Command::new("tasklist")
        .args(["/FI", &filter, "/FO", "CSV", "/NH"])
        .output()
        .map(|o| parse_tasklist(&String::from_utf8_lossy(&o.stdout)).iter().any(|p| p.pid == pid))
        .unwrap_or(false)
}

#[cfg(unix)]
fn signal(handle: &ProcessHandle, sig: libc::c_int) -> bool {
    let pid = handle.pid as libc::pid_t;
    if pid <= 0 {
        return false;
    }
    if handle.owned {
        // Spawned with setsid, so pgid == pid.
        let rc = unsafe { libc::kill(-pid, sig) };
        if rc == 0 {
            return true;
        }
    }
    unsafe { libc::kill(pid, sig) == 0 }
}

#[cfg(unix)]
fn send_terminate(handle: &ProcessHandle) -> bool {
    signal(handle, libc::SIGTERM)
}

#[cfg(unix)]
fn send_kill(handle: &ProcessHandle) -> bool {
    signal(handle, libc::SIGKILL)
}

#[cfg(windows)]
fn send_terminate(handle: &ProcessHandle) -> bool {
    std::process::Command::new("taskkill")
        .args(["/PID", &handle.pid.to_string(), "/T"])
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[cfg(windows)]
fn send_kill(handle: &ProcessHandle) -> bool {
    std::process::Command::new("taskkill")
        .args(["/PID", &handle.pid.to_string(), "/T", "/F"])
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matcher_ignores_case_and_exe_suffix() {
        let m = NameMatcher::new("OBS64.exe").unwrap();
        assert!(m.matches("obs64"));
        assert!(m.matches("obs64.EXE"));
        assert!(!m.matches("obs"));
    }

    #[test]
    fn matcher_supports_globs() {
        let m = NameMatcher::new("eldenring*").unwrap();
        assert!(m.matches("EldenRing.exe"));
        assert!(m.matches("eldenring_launcher"));
        assert!(!m.matches("start_protected_game"));
    }

    #[test]
    fn empty_pattern_matches_nothing() {
        assert!(NameMatcher::new("   ").is_none());
        assert!(ProcessController::new().find_running("").is_none());
    }

    #[test]
    fn tasklist_rows_are_parsed() {
        let out = "\"obs64.exe\",\"4242\",\"Console\",\"1\",\"250,000 K\"\r\nINFO: nothing\r\n";
        let rows = parse_tasklist(out);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].pid, 4242);
        assert_eq!(rows[0].names, vec!["obs64.exe".to_string()]);
    }

    #[tokio::test]
    async fn missing_executable_is_not_found() {
        let err = ProcessController::new()
            .start_process(Path::new("/definitely/not/here/game"), &[], None)
            .unwrap_err();
        assert!(matches!(err, ProcessError::NotFound(_)));
    }

    #[test]
    fn unknown_process_is_not_running() {
        let name = "loadout-no-such-process-7f3c2a";
        assert!(ProcessController::new().find_running(name).is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn wait_for_exit_reports_exit_code() {
        let pc = ProcessController::new();
        let h = pc
            .start_process(
                Path::new("sh"),
                &["-c".to_string(), "exit 3".to_string()],
                None,
            )
            .unwrap();
        assert!(h.is_owned());
        assert_eq!(pc.wait_for_exit(&h).await, ExitCode(Some(3)));
        assert!(h.has_exited());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_is_graceful_then_idempotent() {
        let pc = ProcessController::new();
        let h = pc
            .start_process(Path::new("sleep"), &["30".to_string()], None)
            .unwrap();

        let first = pc.request_stop(&h, Duration::from_secs(5)).await;
        assert_eq!(first, StopOutcome::Stopped);

        let started = std::time::Instant::now();
        let second = pc.request_stop(&h, Duration::from_secs(5)).await;
        assert_eq!(second, StopOutcome::AlreadyGone);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_escalates_when_term_is_ignored() {
        let pc = ProcessController::new();
        let h = pc
            .start_process(
                Path::new("sh"),
                &["-c".to_string(), "trap '' TERM; sleep 30".to_string()],
                None,
            )
            .unwrap();
        // Give the shell time to install the trap.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let outcome = pc.request_stop(&h, Duration::from_millis(300)).await;
        assert_eq!(outcome, StopOutcome::Forced);
        assert!(h.has_exited());
    }

    #[cfg(unix)]
    #[test]
    fn sleeper_link_is_removed_on_drop() {
        let sleeper = testing::unique_sleeper("cleanup");
        let exe = sleeper.path();
        assert!(exe.exists());
        drop(sleeper);
        assert!(!exe.exists());
        assert!(!exe.parent().unwrap().exists());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn spawned_process_can_be_found_by_name() {
        let pc = ProcessController::new();
        let h = pc
            .start_process(Path::new("sleep"), &["30".to_string()], None)
            .unwrap();

        let found = pc.find_running("sleep*");
        assert!(found.is_some());

        pc.request_stop(&h, Duration::from_secs(2)).await;
    }
}
