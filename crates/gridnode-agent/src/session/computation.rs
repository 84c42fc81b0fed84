//! Computation supervisor.
//!
//! Wraps exactly one subprocess: spawn, control signals, polite and forceful
//! termination, heartbeat capture and status reporting. The subprocess
//! connects back to the router's IPC socket and registers as an executor;
//! control messages reach it through the router.

use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use gridnode_common::error::{GridError, Result};
use gridnode_common::object;
use gridnode_common::protocol::ExecutorHeartbeat;

use crate::events::EventSender;
use crate::router_link::RouterLink;
use crate::session::spawn::SpawnSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcState {
    NotSpawned,
    Spawned { pid: i32 },
    Terminating { pid: i32 },
    Exited {
        code: Option<i32>,
        signal: Option<i32>,
    },
}

/// Rolling heartbeat sample with running maxima.
#[derive(Default)]
struct HeartbeatStats {
    last: Option<ExecutorHeartbeat>,
    cpu_usage_5s_max: f32,
    cpu_usage_60s_max: f32,
    memory_usage_bytes_max: u64,
    last_sent_secs: i64,
    last_sent_usecs: i64,
    last_received_secs: i64,
    last_received_usecs: i64,
}

/// One supervised computation subprocess.
pub struct Computation {
    id: Uuid,
    name: String,
    session_id: Uuid,
    link: Arc<RouterLink>,
    events: EventSender,
    state: Mutex<ProcState>,
    exited: Notify,
    sent_go: AtomicBool,
    termination_expected: AtomicBool,
    stats: Mutex<HeartbeatStats>,
    last_activity_secs: AtomicI64,
    auto_suspend: bool,
    exec_config_path: Option<PathBuf>,
}

impl Computation {
    pub fn new(
        id: Uuid,
        name: &str,
        session_id: Uuid,
        link: Arc<RouterLink>,
        events: EventSender,
        auto_suspend: bool,
        exec_config_path: Option<PathBuf>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: name.to_string(),
            session_id,
            link,
            events,
            state: Mutex::new(ProcState::NotSpawned),
            exited: Notify::new(),
            sent_go: AtomicBool::new(false),
            termination_expected: AtomicBool::new(false),
            stats: Mutex::new(HeartbeatStats::default()),
            last_activity_secs: AtomicI64::new(now_secs()),
            auto_suspend,
            exec_config_path,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn last_activity_secs(&self) -> i64 {
        self.last_activity_secs.load(Ordering::Relaxed)
    }

    fn touch_activity(&self) {
        self.last_activity_secs.store(now_secs(), Ordering::Relaxed);
    }

    /// Spawns the subprocess in its own process group and starts the waiter
    /// task that records its exit.
    pub fn start(self: &Arc<Self>, spec: SpawnSpec) -> Result<()> {
        let mut cmd = tokio::process::Command::new(&spec.program);
        cmd.args(&spec.args);
        if !spec.inherit_environment {
            // clean environment, keeping PATH so the program resolves
            cmd.env_clear();
            if let Ok(path) = std::env::var("PATH") {
                cmd.env("PATH", path);
            }
        }
        cmd.envs(&spec.env);
        if let Some(dir) = &spec.working_directory {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(spec.cleanup_process_group);
        // own process group, so stop/continue/kill signals reach the whole
        // tree the computation spawns
        unsafe {
            cmd.pre_exec(|| {
                libc::setpgid(0, 0);
                Ok(())
            });
        }

        let mut child = cmd.spawn().map_err(|err| {
            tracing::error!(
                session = %self.session_id,
                "failed to spawn process for {}: {err}",
                self.name
            );
            GridError::Spawn(format!("cannot start computation {}", self.name))
        })?;

        let pid = child.id().map(|p| p as i32).unwrap_or(0);
        *self.state.lock().expect("state lock poisoned") = ProcState::Spawned { pid };
        self.termination_expected.store(false, Ordering::SeqCst);
        self.touch_activity();

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let status = child.wait().await;
            this.on_terminate(status);
        });

        Ok(())
    }

    fn on_terminate(&self, status: std::io::Result<std::process::ExitStatus>) {
        let (code, signal) = match &status {
            Ok(st) => (st.code(), st.signal()),
            Err(err) => {
                tracing::error!(
                    session = %self.session_id,
                    "error waiting for computation {}: {err}",
                    self.name
                );
                (None, None)
            }
        };
        *self.state.lock().expect("state lock poisoned") = ProcState::Exited { code, signal };
        self.exited.notify_waiters();

        let expected = self.termination_expected.load(Ordering::SeqCst);
        let reason = format!("{} {}", self.name, exit_status_string(code, signal, expected));
        self.events.send(
            Some(self.session_id),
            Some(self.id),
            json!({ "eventType": "computationTerminated", "reason": reason }),
        );
    }

    /// Polite stop: marks termination as expected and asks the subprocess to
    /// stop via a control message.
    pub fn shutdown(&self) {
        self.termination_expected.store(true, Ordering::SeqCst);
        let mut state = self.state.lock().expect("state lock poisoned");
        if let ProcState::Spawned { pid } = *state {
            *state = ProcState::Terminating { pid };
        }
        drop(state);
        self.link.send_stop(self.id, self.session_id);
    }

    /// Last resort after a polite stop has run out its deadline.
    pub fn force_kill(&self) {
        if let Some(pid) = self.pid() {
            tracing::warn!(
                session = %self.session_id,
                "forcefully killing computation {} [pid {}]",
                self.name,
                pid
            );
            unsafe {
                libc::kill(-pid, libc::SIGKILL);
            }
        }
    }

    fn pid(&self) -> Option<i32> {
        match *self.state.lock().expect("state lock poisoned") {
            ProcState::Spawned { pid } | ProcState::Terminating { pid } if pid > 0 => Some(pid),
            _ => None,
        }
    }

    /// Waits until the subprocess has exited, up to the deadline. Returns
    /// whether it is down.
    pub async fn wait_until_exit(&self, deadline: Instant) -> bool {
        loop {
            if self.is_down() {
                return true;
            }
            let notified = self.exited.notified();
            // re-check after registering so a notify between the check and
            // the await is not missed
            if self.is_down() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.is_down();
            }
        }
    }

    fn is_down(&self) -> bool {
        matches!(
            *self.state.lock().expect("state lock poisoned"),
            ProcState::Exited { .. } | ProcState::NotSpawned
        )
    }

    /// Applies a session signal to this computation.
    ///
    /// The first `run` for a spawned computation sends `go` (and suspends
    /// the process group when auto-suspend is enabled); later `run` signals
    /// send `update` carrying the new data.
    pub fn signal(&self, signal_data: &Value) {
        let status = object::get_str(signal_data, "status", "");
        if status != "run" {
            return;
        }
        let spawned = matches!(
            *self.state.lock().expect("state lock poisoned"),
            ProcState::Spawned { .. }
        );
        if !spawned {
            return;
        }

        if self.sent_go.swap(true, Ordering::SeqCst) {
            // already running, so this is a routing update
            self.link
                .send_control(self.id, self.session_id, "update", Some(signal_data));
        } else {
            self.link
                .send_control(self.id, self.session_id, "go", Some(signal_data));
            if self.auto_suspend {
                // debugging aid: resume the group manually with SIGCONT
                tracing::info!(
                    "auto-suspending computation {} by sending SIGSTOP; use SIGCONT to resume",
                    self.name
                );
                if let Some(pid) = self.pid() {
                    unsafe {
                        libc::kill(-pid, libc::SIGSTOP);
                    }
                }
            }
        }
    }

    /// Records a heartbeat sample, updating the running maxima and activity
    /// timestamps.
    pub fn on_heartbeat(&self, heartbeat: ExecutorHeartbeat) {
        let mut stats = self.stats.lock().expect("stats lock poisoned");
        if heartbeat.cpu_usage_5s > stats.cpu_usage_5s_max {
            stats.cpu_usage_5s_max = heartbeat.cpu_usage_5s;
        }
        if heartbeat.cpu_usage_60s > stats.cpu_usage_60s_max {
            stats.cpu_usage_60s_max = heartbeat.cpu_usage_60s;
        }
        if heartbeat.memory_usage_bytes > stats.memory_usage_bytes_max {
            stats.memory_usage_bytes_max = heartbeat.memory_usage_bytes;
        }
        if heartbeat.sent_messages_5s > 0 {
            stats.last_sent_secs = heartbeat.transmit_secs;
            stats.last_sent_usecs = heartbeat.transmit_usecs;
            self.last_activity_secs
                .store(heartbeat.transmit_secs, Ordering::Relaxed);
        }
        if heartbeat.received_messages_5s > 0 {
            stats.last_received_secs = heartbeat.transmit_secs;
            stats.last_received_usecs = heartbeat.transmit_usecs;
            self.last_activity_secs
                .store(heartbeat.transmit_secs, Ordering::Relaxed);
        }
        stats.last = Some(heartbeat);
    }

    /// Current state as a JSON object for the session status endpoint.
    pub fn status(&self) -> Value {
        let state = *self.state.lock().expect("state lock poisoned");
        match state {
            ProcState::NotSpawned => json!({ "state": "NotStarted" }),
            ProcState::Spawned { .. } => {
                if self.sent_go.load(Ordering::SeqCst) {
                    json!({ "state": "Running" })
                } else {
                    json!({ "state": "Starting" })
                }
            }
            ProcState::Terminating { .. } => json!({ "state": "Stopping" }),
            ProcState::Exited { code, signal } => {
                let expected = self.termination_expected.load(Ordering::SeqCst);
                let mut status = json!({
                    "state": "Stopped",
                    "stoppedReason": exit_status_string(code, signal, expected),
                });
                if let Some(code) = code {
                    status["exitType"] = json!("Exit");
                    status["exitCode"] = json!(code);
                } else if let Some(signal) = signal {
                    status["exitType"] = json!("Signal");
                    status["signal"] = json!(signal);
                }
                status
            }
        }
    }

    /// Heartbeat rollups for the performance endpoint.
    pub fn performance_stats(&self) -> Value {
        let stats = self.stats.lock().expect("stats lock poisoned");
        let Some(last) = &stats.last else {
            return json!({});
        };
        json!({
            "memoryUsageBytesMax": stats.memory_usage_bytes_max,
            "memoryUsageBytesCurrent": last.memory_usage_bytes,
            "cpuUsage5Secs": last.cpu_usage_5s,
            "cpuUsage5SecsMax": stats.cpu_usage_5s_max,
            "cpuUsage60Secs": last.cpu_usage_60s,
            "cpuUsage60SecsMax": stats.cpu_usage_60s_max,
            "cpuUsageTotalSecs": last.cpu_usage_total_secs,
            "hyperthreaded": last.hyperthreaded,
            "sentMessagesCount5Secs": last.sent_messages_5s,
            "sentMessagesCount60Secs": last.sent_messages_60s,
            "sentMessagesCountTotal": last.sent_messages_total,
            "receivedMessagesCount5Secs": last.received_messages_5s,
            "receivedMessagesCount60Secs": last.received_messages_60s,
            "receivedMessagesCountTotal": last.received_messages_total,
            "lastHeartbeatTime": time_string(last.transmit_secs, last.transmit_usecs),
            "lastSentMessagesTime": time_string(stats.last_sent_secs, stats.last_sent_usecs),
            "lastReceivedMessagesTime": time_string(stats.last_received_secs, stats.last_received_usecs),
        })
    }
}

impl Drop for Computation {
    fn drop(&mut self) {
        if let Some(path) = &self.exec_config_path {
            let _ = std::fs::remove_file(path);
        }
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn exit_status_string(code: Option<i32>, signal: Option<i32>, expected: bool) -> String {
    match (code, signal) {
        (Some(0), _) => "exited normally".to_string(),
        (Some(code), _) if expected => format!("exited with code {code} during shutdown"),
        (Some(code), _) => format!("exited unexpectedly with code {code}"),
        (None, Some(signal)) => format!("exited due to signal {signal}"),
        (None, None) => "exited with unknown status".to_string(),
    }
}

fn time_string(secs: i64, usecs: i64) -> String {
    if secs == 0 && usecs == 0 {
        return String::new();
    }
    format!("{}.{:03}", secs, usecs / 1000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_status_strings() {
        assert_eq!(exit_status_string(Some(0), None, false), "exited normally");
        assert_eq!(
            exit_status_string(Some(1), None, false),
            "exited unexpectedly with code 1"
        );
        assert_eq!(
            exit_status_string(Some(143), None, true),
            "exited with code 143 during shutdown"
        );
        assert_eq!(
            exit_status_string(None, Some(9), false),
            "exited due to signal 9"
        );
    }

    #[test]
    fn test_time_string_empty_when_unset() {
        assert_eq!(time_string(0, 0), "");
        assert_eq!(time_string(1700000000, 250_000), "1700000000.250");
    }
}
