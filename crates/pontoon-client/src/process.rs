//! Server process controller.
//!
//! Spawns the renderer host as a child process, hands it the session GUID,
//! the bridge version string and the game's own command line, and watches
//! it: a monitor thread fires a one-shot exit callback the moment the
//! child is reaped, which is how unexpected server death turns into
//! "bridge disabled" on the client.

use std::io;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use pontoon_core::{SessionGuid, BRIDGE_VERSION};

/// One-shot callback with the child's exit code (when reported).
pub type ExitCallback = Box<dyn FnOnce(Option<i32>) + Send>;

pub struct ServerProcess {
    child: Arc<Mutex<Child>>,
    pid: u32,
    stop: Arc<AtomicBool>,
    monitor: Option<std::thread::JoinHandle<()>>,
    started: Instant,
}

impl ServerProcess {
    /// Spawn `executable <guid> <version> <game args…>` and start watching
    /// it.
    pub fn spawn(
        executable: &Path,
        guid: SessionGuid,
        game_args: &[String],
        on_exit: ExitCallback,
    ) -> io::Result<Self> {
        let child = Command::new(executable)
            .arg(guid.to_string())
            .arg(BRIDGE_VERSION)
            .args(game_args)
            .stdin(Stdio::null())
            .spawn()?;
        let pid = child.id();
        tracing::info!(pid, exe = %executable.display(), "server process spawned");

        let child = Arc::new(Mutex::new(child));
        let stop = Arc::new(AtomicBool::new(false));
        let monitor = {
            let child = child.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                let mut on_exit = Some(on_exit);
                loop {
                    if stop.load(Ordering::Relaxed) {
                        return;
                    }
                    let status = child.lock().try_wait();
                    match status {
                        Ok(Some(status)) => {
                            if let Some(on_exit) = on_exit.take() {
                                on_exit(status.code());
                            }
                            return;
                        }
                        Ok(None) => {}
                        Err(err) => {
                            tracing::error!(%err, "server process wait failed");
                            if let Some(on_exit) = on_exit.take() {
                                on_exit(None);
                            }
                            return;
                        }
                    }
                    std::thread::sleep(Duration::from_millis(20));
                }
            })
        };

        Ok(Self {
            child,
            pid,
            stop,
            monitor: Some(monitor),
            started: Instant::now(),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_running(&self) -> bool {
        matches!(self.child.lock().try_wait(), Ok(None))
    }

    /// Wait up to `timeout` for the child to exit on its own.
    pub fn wait_exit(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if !self.is_running() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        !self.is_running()
    }

    /// Orderly teardown after Terminate/Ack: give the child a grace period
    /// then kill it, and stop the monitor so the exit callback does not
    /// fire for an exit we initiated.
    pub fn shutdown(mut self, grace: Duration) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(monitor) = self.monitor.take() {
            let _ = monitor.join();
        }
        if !self.wait_exit(grace) {
            tracing::warn!(pid = self.pid, "server did not exit in time, killing it");
            let _ = self.child.lock().kill();
            let _ = self.child.lock().wait();
        } else {
            // Reap.
            let _ = self.child.lock().try_wait();
        }
        tracing::info!(
            pid = self.pid,
            uptime_secs = self.started.elapsed().as_secs(),
            "server process shut down"
        );
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(monitor) = self.monitor.take() {
            let _ = monitor.join();
        }
    }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::mpsc;

    /// Write an executable helper script that ignores the guid/version
    /// arguments the controller always prepends.
    fn helper_script(dir: &tempfile::TempDir, body: &str) -> std::path::PathBuf {
        let path = dir.path().join("fake_server.sh");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh\n{body}").unwrap();
        let mut perms = file.metadata().unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[test]
    fn exit_callback_fires_on_child_exit() {
        let dir = tempfile::tempdir().unwrap();
        let exe = helper_script(&dir, "exit 0");
        let (tx, rx) = mpsc::channel();
        let process = ServerProcess::spawn(
            &exe,
            SessionGuid::generate(),
            &[],
            Box::new(move |code| {
                let _ = tx.send(code);
            }),
        )
        .unwrap();

        let code = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(code, Some(0));
        assert!(!process.is_running());
    }

    #[test]
    fn exit_callback_reports_failure_code() {
        let dir = tempfile::tempdir().unwrap();
        let exe = helper_script(&dir, "exit 3");
        let (tx, rx) = mpsc::channel();
        let _process = ServerProcess::spawn(
            &exe,
            SessionGuid::generate(),
            &[],
            Box::new(move |code| {
                let _ = tx.send(code);
            }),
        )
        .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Some(3));
    }

    #[test]
    fn shutdown_kills_a_lingering_child_without_callback() {
        let dir = tempfile::tempdir().unwrap();
        let exe = helper_script(&dir, "sleep 30");
        let (tx, rx) = mpsc::channel::<Option<i32>>();
        let process = ServerProcess::spawn(
            &exe,
            SessionGuid::generate(),
            &[],
            Box::new(move |code| {
                let _ = tx.send(code);
            }),
        )
        .unwrap();
        assert!(process.is_running());
        process.shutdown(Duration::from_millis(100));
        // The exit we initiated must not look like a crash.
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn wait_exit_times_out_for_running_child() {
        let dir = tempfile::tempdir().unwrap();
        let exe = helper_script(&dir, "sleep 5");
        let process =
            ServerProcess::spawn(&exe, SessionGuid::generate(), &[], Box::new(|_| {})).unwrap();
        assert!(process.is_running());
        assert!(!process.wait_exit(Duration::from_millis(50)));
        process.shutdown(Duration::from_millis(10));
    }

    #[test]
    fn game_args_are_forwarded_after_guid_and_version() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("args.txt");
        let exe = helper_script(&dir, &format!("echo \"$@\" > {}", marker.display()));
        let (tx, rx) = mpsc::channel();
        let guid = SessionGuid::generate();
        let _process = ServerProcess::spawn(
            &exe,
            guid,
            &["-window".into(), "-w1024".into()],
            Box::new(move |code| {
                let _ = tx.send(code);
            }),
        )
        .unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let recorded = std::fs::read_to_string(&marker).unwrap();
        let recorded: Vec<&str> = recorded.split_whitespace().collect();
        assert_eq!(recorded[0], guid.to_string());
        assert_eq!(recorded[1], BRIDGE_VERSION);
        assert_eq!(&recorded[2..], &["-window", "-w1024"]);
    }
}
