//! Node-level agent state.
//!
//! Everything about this host that is not a session: the node info document
//! registered with the Coordinator, tag management, status control
//! (shutdown/close/unregistered), health checks and process limits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::sync::watch;
use uuid::Uuid;

use gridnode_common::error::{GridError, Result};
use gridnode_common::object;

use crate::defaults::ComputationDefaults;
use crate::session::manager::SessionManager;

pub struct Agent {
    node_id: Uuid,
    defaults: ComputationDefaults,
    node_info: Mutex<Value>,
    info_updating: Mutex<bool>,
    registered: AtomicBool,
    stop: watch::Sender<bool>,
}

impl Agent {
    pub fn new(node_id: Uuid, defaults: ComputationDefaults) -> Arc<Self> {
        let (stop, _) = watch::channel(false);
        Arc::new(Self {
            node_id,
            defaults,
            node_info: Mutex::new(json!({})),
            info_updating: Mutex::new(false),
            registered: AtomicBool::new(false),
            stop,
        })
    }

    pub fn node_id(&self) -> Uuid {
        self.node_id
    }

    pub fn stop_watch(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }

    /// Watch sender for the run loop; the event pipeline uses it for
    /// `shutdownWithError`.
    pub fn stop_sender(&self) -> watch::Sender<bool> {
        self.stop.clone()
    }

    pub fn stop_running(&self) {
        // send_replace so the request isn't lost when no receiver is
        // subscribed yet
        self.stop.send_replace(true);
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    pub fn set_registered(&self, registered: bool) {
        self.registered.store(registered, Ordering::SeqCst);
    }

    /// Builds the node info document sent to the Coordinator at
    /// registration.
    pub fn build_node_info(
        &self,
        http_port: u16,
        router_port: u16,
        hostname: &str,
        ip_addr: &str,
    ) -> Value {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        // reserve one core for the agent itself
        let computation_cores = cores.saturating_sub(1).max(1);
        let memory_mb = physical_memory_bytes() >> 20;

        let info = json!({
            "id": self.node_id.to_string(),
            "hostname": hostname,
            "ipAddress": ip_addr,
            "httpPort": http_port,
            "port": router_port,
            "status": "UP",
            "resources": {
                "cores": computation_cores,
                "memoryMB": memory_mb,
            },
            "tags": {},
            "hrefs": {
                "sessions": format!("http://{}:{}/sessions", ip_addr, http_port),
            },
        });
        *self.node_info.lock().expect("node info lock poisoned") = info.clone();
        info
    }

    pub fn node_info(&self) -> Value {
        self.node_info.lock().expect("node info lock poisoned").clone()
    }

    /// Handles `PUT /status` (and `/registration`).
    pub fn set_status(&self, payload: &Value, manager: &SessionManager) -> Result<()> {
        let Some(status) = object::member(payload, "status").as_str() else {
            return Err(GridError::BadRequest(
                "Request body is missing 'status' field".to_string(),
            ));
        };
        match status {
            "shutdown" => {
                self.stop_running();
                Ok(())
            }
            "close" => {
                manager.set_closed(true);
                Ok(())
            }
            "unregistered" => {
                // the Coordinator dropped us; just don't deregister again
                self.set_registered(false);
                Ok(())
            }
            other => Err(GridError::BadRequest(format!(
                "Unknown 'status' value: {other}"
            ))),
        }
    }

    /// Merges a tag object into the node info. One update runs at a time;
    /// a second concurrent attempt conflicts.
    pub fn update_tags(self: &Arc<Self>, tags: &Value) -> Result<()> {
        if !tags.is_object() {
            return Err(GridError::BadRequest(
                "Invalid tag set (JSON object is required)".to_string(),
            ));
        }
        let tags = tags.clone();
        self.begin_tag_update(move |current| {
            let mut merged = current.clone();
            for (key, value) in tags.as_object().expect("checked above") {
                merged[key] = value.clone();
            }
            merged
        })
    }

    /// Removes the listed tags from the node info.
    pub fn delete_tags(self: &Arc<Self>, tags: &Value) -> Result<()> {
        let Some(list) = tags.as_array() else {
            return Err(GridError::BadRequest(
                "Invalid tag list (JSON array is required)".to_string(),
            ));
        };
        let names: Vec<String> = list
            .iter()
            .filter_map(Value::as_str)
            .map(ToOwned::to_owned)
            .collect();
        self.begin_tag_update(move |current| {
            let mut updated = current.clone();
            if let Some(obj) = updated.as_object_mut() {
                for name in &names {
                    obj.remove(name);
                }
            }
            updated
        })
    }

    fn begin_tag_update<F>(self: &Arc<Self>, mutate: F) -> Result<()>
    where
        F: FnOnce(&Value) -> Value + Send + 'static,
    {
        let proposed = {
            let mut updating = self.info_updating.lock().expect("updating lock poisoned");
            if *updating {
                return Err(GridError::Conflict(
                    "Cannot modify node tags, because service is busy with another update"
                        .to_string(),
                ));
            }
            let info = self.node_info.lock().expect("node info lock poisoned");
            let proposed = mutate(&info["tags"]);
            validate_tags(&proposed)?;
            *updating = true;
            proposed
        };

        let this = Arc::clone(self);
        tokio::spawn(async move {
            {
                let mut info = this.node_info.lock().expect("node info lock poisoned");
                info["tags"] = proposed;
            }
            *this.info_updating.lock().expect("updating lock poisoned") = false;
        });
        Ok(())
    }

    /// Verifies the node is healthy; an error carries why it isn't.
    pub fn check_health(&self) -> Result<()> {
        self.check_ipc_socket()?;
        self.check_disk()?;
        Ok(())
    }

    fn check_ipc_socket(&self) -> Result<()> {
        use std::os::unix::fs::{FileTypeExt, PermissionsExt};

        let path = &self.defaults.ipc_path;
        let metadata = std::fs::metadata(path).map_err(|_| {
            GridError::Internal(format!(
                "IPC socket file {} does not exist",
                path.display()
            ))
        })?;
        if !metadata.file_type().is_socket() {
            return Err(GridError::Internal(format!(
                "IPC socket file {} exists, but is not a socket",
                path.display()
            )));
        }
        let mode = metadata.permissions().mode();
        if mode & 0o700 != 0o700 {
            return Err(GridError::Internal(format!(
                "IPC socket file {} exists, but permissions are {:o}: required permissions are 700",
                path.display(),
                mode & 0o777
            )));
        }
        Ok(())
    }

    fn check_disk(&self) -> Result<()> {
        if let Some(used) = root_partition_usage() {
            if used >= 0.98 {
                return Err(GridError::Internal(format!(
                    "Root partition usage at {:.1}%",
                    used * 100.0
                )));
            }
        }

        // verify the temp filesystem actually accepts writes
        let probe = self
            .defaults
            .tmp_dir
            .join(format!("probe-{}", Uuid::new_v4()));
        std::fs::write(&probe, b"1").map_err(|err| {
            GridError::Internal(format!(
                "Unable to write a sample tmp file {}: {err}",
                probe.display()
            ))
        })?;
        std::fs::remove_file(&probe).map_err(|err| {
            GridError::Internal(format!(
                "Unable to remove sample tmp file {}: {err}",
                probe.display()
            ))
        })?;
        Ok(())
    }
}

/// Tag validation rules shared by update and delete paths.
fn validate_tags(tags: &Value) -> Result<()> {
    let mut errors = String::new();

    if tags["exclusive_production"].is_null() && !tags["exclusive_team"].is_null() {
        errors.push_str(
            "Error in tag set : 'exclusive_team' requires 'exclusive_production' to be set. ",
        );
    }
    if !tags["over_subscribe"].is_null() && !tags["over_subscribe"].is_boolean() {
        errors.push_str("Error in tag set : 'over_subscribe' should be type bool. ");
    }
    if tags["exclusive_user"].is_null() && tags["over_subscribe"] == json!(true) {
        errors.push_str("Error in tag set : 'over_subscribe' requires 'exclusive_user' to be set. ");
    }

    if errors.is_empty() {
        Ok(())
    } else {
        tracing::error!("{}", errors);
        Err(GridError::BadRequest(errors))
    }
}

/// Raises the file descriptor ceiling to the hard limit; endpoints, sockets
/// and subprocesses all consume descriptors.
pub fn raise_fd_limit() -> Result<()> {
    let mut limits = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limits) } != 0 {
        return Err(GridError::Internal(
            "Failed to get current file descriptor limits".to_string(),
        ));
    }
    if limits.rlim_cur < limits.rlim_max {
        tracing::debug!(
            "current fd limit at {}, setting to max of {}",
            limits.rlim_cur,
            limits.rlim_max
        );
        limits.rlim_cur = limits.rlim_max;
        if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &limits) } != 0 {
            return Err(GridError::Internal(
                "Failed to set current file descriptor limits".to_string(),
            ));
        }
    }
    Ok(())
}

fn physical_memory_bytes() -> u64 {
    let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) };
    if pages > 0 && page_size > 0 {
        pages as u64 * page_size as u64
    } else {
        0
    }
}

fn root_partition_usage() -> Option<f64> {
    let path = std::ffi::CString::new("/").expect("static path");
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statvfs(path.as_ptr(), &mut stat) } != 0 {
        return None;
    }
    let capacity = stat.f_blocks as f64 * stat.f_frsize as f64;
    if capacity <= 0.0 {
        return None;
    }
    let available = stat.f_bavail as f64 * stat.f_frsize as f64;
    Some((capacity - available) / capacity)
}
