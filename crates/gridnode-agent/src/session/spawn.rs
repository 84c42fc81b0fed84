//! Computation spawn specifications.
//!
//! Builds the subprocess invocation for one computation from its definition
//! and writes the exec-side config document the subprocess reads at startup.
//! The document lands at `<tmp>/exec-<name>-<compId>` and its path is the
//! final program argument.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use uuid::Uuid;

use gridnode_common::error::{GridError, Result};
use gridnode_common::object;

use crate::defaults::ComputationDefaults;
use crate::session::config::SessionConfig;

/// Everything needed to launch one computation subprocess.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_directory: Option<PathBuf>,
    pub assigned_memory_mb: u64,
    pub assigned_cores: u64,
    pub cleanup_process_group: bool,
    /// Inherit the agent's environment instead of starting clean.
    pub inherit_environment: bool,
}

/// Builder for one computation's spawn spec and exec config document.
pub struct ComputationSpawn {
    computation_id: Uuid,
    node_id: Uuid,
    session_id: Uuid,
    name: String,
    exec_config_path: PathBuf,
    defaults: ComputationDefaults,
    spec: SpawnSpec,
    exec_config: Value,
}

impl ComputationSpawn {
    pub fn new(
        computation_id: Uuid,
        node_id: Uuid,
        session_id: Uuid,
        name: &str,
        defaults: &ComputationDefaults,
    ) -> Self {
        let exec_config_path = defaults
            .tmp_dir
            .join(format!("exec-{}-{}", name, computation_id));
        Self {
            computation_id,
            node_id,
            session_id,
            name: name.to_string(),
            exec_config_path,
            defaults: defaults.clone(),
            spec: SpawnSpec {
                program: defaults.executor_program.clone(),
                args: Vec::new(),
                env: BTreeMap::new(),
                working_directory: None,
                assigned_memory_mb: defaults.def_memory_mb,
                assigned_cores: defaults.def_cores,
                cleanup_process_group: defaults.cleanup_process_group,
                inherit_environment: false,
            },
            exec_config: Value::Null,
        }
    }

    pub fn exec_config_path(&self) -> &Path {
        &self.exec_config_path
    }

    /// Fills in the spawn spec from the computation definition.
    ///
    /// Reads `requirements.resources` (memoryMB, cores, logLevel),
    /// `messaging` (chunking parameters), `environment` and
    /// `workingDirectory`; anything missing or malformed falls back to the
    /// defaults with a logged warning.
    pub fn set_definition(&mut self, definition: &Value, session_log_level: i64) {
        let requirements = object::object(definition, "requirements");
        let resources = object::object(requirements, "resources");
        let messaging = object::object(definition, "messaging");
        let environment = object::object(definition, "environment");

        self.spec.assigned_memory_mb =
            object::get_non_neg(resources, "memoryMB", self.defaults.def_memory_mb as f64) as u64;
        self.spec.assigned_cores =
            object::get_non_neg(resources, "cores", self.defaults.def_cores as f64) as u64;

        let working_directory = object::get_str(definition, "workingDirectory", "");
        if !working_directory.is_empty() {
            self.spec.working_directory = Some(PathBuf::from(working_directory));
        }

        let args = &mut self.spec.args;
        args.push("--memoryMB".to_string());
        args.push(self.spec.assigned_memory_mb.to_string());
        args.push("--cores".to_string());
        args.push(self.spec.assigned_cores.to_string());

        let disable_chunking =
            object::get_bool(messaging, "disableChunking", self.defaults.def_disable_chunking);
        if disable_chunking {
            args.push("--disableChunking".to_string());
            args.push("1".to_string());
        } else {
            let min_chunking = object::get_u64(
                messaging,
                "minimumChunkingSize",
                self.defaults.def_min_chunking_size,
            );
            let chunk_size = object::get_u64(messaging, "chunkSize", self.defaults.def_chunk_size);
            args.push("--minimumChunkingSize".to_string());
            args.push(min_chunking.to_string());
            args.push("--chunkSize".to_string());
            args.push(chunk_size.to_string());
        }

        args.push(self.exec_config_path.display().to_string());

        if let Some(env_obj) = environment.as_object() {
            for (key, val) in env_obj {
                if let Some(s) = val.as_str() {
                    self.spec.env.insert(key.clone(), s.to_string());
                }
            }
        }

        let log_level = object::get_i64(resources, "logLevel", session_log_level);

        self.exec_config = json!({
            "sessionId": self.session_id.to_string(),
            "compId": self.computation_id.to_string(),
            "nodeId": self.node_id.to_string(),
            "ipc": self.defaults.ipc_path.display().to_string(),
            "logLevel": log_level,
            "user": std::env::var("USER").unwrap_or_else(|_| "unknown".to_string()),
            "config": {},
        });
        self.exec_config["config"][&self.name] = definition.clone();
        self.exec_config["config"][&self.name]["computationId"] =
            json!(self.computation_id.to_string());
    }

    /// Adds the session routing table to the exec config.
    pub fn add_routing(&mut self, routing: &Value) {
        self.exec_config["routing"] = routing.clone();
    }

    /// Applies the definition's packaging wrapper to the spawn spec.
    ///
    /// The agent realizes only wrappers it can express directly: none (run
    /// the executor from PATH) and current-environment (inherit the agent's
    /// environment). Anything else fails the operation.
    pub fn apply_packaging(&mut self, definition: &Value) -> Result<()> {
        let requirements = object::object(definition, "requirements");
        let packaging = object::get_str(requirements, "packaging_system", "none");

        match packaging.as_str() {
            "" | "none" => Ok(()),
            "current-environment" => {
                self.spec.inherit_environment = true;
                Ok(())
            }
            other => {
                tracing::warn!(
                    session = %self.session_id,
                    "in config for {}: unknown packaging system '{}'",
                    self.name,
                    other
                );
                Err(GridError::Spawn(format!(
                    "unknown packaging system '{other}'"
                )))
            }
        }
    }

    /// Writes the exec config document to its well-known path.
    pub fn write_exec_config(&self) -> Result<()> {
        let text = serde_json::to_string_pretty(&self.exec_config)?;
        std::fs::write(&self.exec_config_path, text).map_err(|err| {
            GridError::Spawn(format!(
                "failed to save config file {}: {err}",
                self.exec_config_path.display()
            ))
        })
    }

    pub fn into_spec(self) -> SpawnSpec {
        self.spec
    }
}

/// Builds the complete spawn setup for a computation from the session
/// config, writing the exec config file as a side effect.
pub fn prepare_spawn(
    computation_id: Uuid,
    name: &str,
    config: &SessionConfig,
    defaults: &ComputationDefaults,
    log_level: i64,
) -> Result<(SpawnSpec, PathBuf)> {
    let definition = config.definition(name);
    if definition.is_null() {
        tracing::error!(
            session = %config.session_id(),
            "cannot start computation {} [{}] because its definition is not present in the config",
            name,
            computation_id
        );
        return Err(GridError::Spawn(format!("missing definition for {name}")));
    }

    let mut spawn = ComputationSpawn::new(
        computation_id,
        config.node_id(),
        config.session_id(),
        name,
        defaults,
    );
    spawn.set_definition(definition, log_level);
    spawn.add_routing(config.routing());
    spawn
        .apply_packaging(definition)
        .map_err(|err| GridError::Spawn(format!("cannot start computation {name}: {err}")))?;
    spawn.write_exec_config()?;

    let path = spawn.exec_config_path().to_path_buf();
    Ok((spawn.into_spec(), path))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults_in(dir: &Path) -> ComputationDefaults {
        ComputationDefaults {
            tmp_dir: dir.to_path_buf(),
            ipc_path: dir.join("router.sock"),
            ..ComputationDefaults::default()
        }
    }

    #[test]
    fn test_spawn_args_and_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let defaults = defaults_in(dir.path());
        let (comp, node, session) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        let definition = json!({
            "requirements": {"resources": {"memoryMB": 4096, "cores": 2}},
            "environment": {"RENDER_MODE": "preview"},
            "workingDirectory": "/work",
        });

        let mut spawn = ComputationSpawn::new(comp, node, session, "render", &defaults);
        spawn.set_definition(&definition, 3);
        spawn.add_routing(&json!({"nodes": {}}));
        spawn.apply_packaging(&definition).unwrap();
        spawn.write_exec_config().unwrap();

        let written: Value =
            serde_json::from_str(&std::fs::read_to_string(spawn.exec_config_path()).unwrap())
                .unwrap();
        assert_eq!(written["sessionId"], json!(session.to_string()));
        assert_eq!(written["compId"], json!(comp.to_string()));
        assert_eq!(
            written["config"]["render"]["computationId"],
            json!(comp.to_string())
        );
        assert!(written["routing"].is_object());

        let spec = spawn.into_spec();
        assert_eq!(spec.assigned_memory_mb, 4096);
        assert_eq!(spec.assigned_cores, 2);
        assert_eq!(spec.working_directory, Some(PathBuf::from("/work")));
        assert_eq!(spec.env["RENDER_MODE"], "preview");
        // the exec config path is the last argument
        assert!(spec.args.last().unwrap().contains("exec-render-"));
    }

    #[test]
    fn test_unknown_packaging_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let defaults = defaults_in(dir.path());
        let definition = json!({
            "requirements": {"packaging_system": "rez1"},
        });
        let mut spawn = ComputationSpawn::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            "render",
            &defaults,
        );
        spawn.set_definition(&definition, 3);
        assert!(spawn.apply_packaging(&definition).is_err());
    }

    #[test]
    fn test_chunking_disabled_flag() {
        let dir = tempfile::tempdir().unwrap();
        let defaults = defaults_in(dir.path());
        let definition = json!({
            "messaging": {"disableChunking": true},
        });
        let mut spawn = ComputationSpawn::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            "sim",
            &defaults,
        );
        spawn.set_definition(&definition, 3);
        let spec = spawn.into_spec();
        assert!(spec.args.iter().any(|a| a == "--disableChunking"));
        assert!(!spec.args.iter().any(|a| a == "--chunkSize"));
    }

    #[test]
    fn test_prepare_spawn_missing_definition() {
        let dir = tempfile::tempdir().unwrap();
        let defaults = defaults_in(dir.path());
        let session = Uuid::new_v4();
        let node = Uuid::new_v4();
        let comp = Uuid::new_v4();

        let doc = crate::session::config::tests::definition_doc(
            session,
            node,
            &[("render", comp, node)],
            true,
        );
        let config = SessionConfig::parse(&doc, node).unwrap();

        // "ghost" is routed here but has no definition
        let err = prepare_spawn(Uuid::new_v4(), "ghost", &config, &defaults, 3).unwrap_err();
        assert!(err.to_string().contains("missing definition"));
    }
}
