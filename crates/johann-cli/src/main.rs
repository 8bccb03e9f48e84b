use anyhow::{anyhow, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use johann_conductor::docker::DockerHostControl;
use johann_conductor::task::TaskContext;
use johann_conductor::{
    CodeVersion, Conductor, HostControlRegistry, JohannConfig, JohannResponse, MemoryHostControl,
    RollCallUpdate, TaskHandler,
};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "johann", version = "0.4.0", about = "Johann scenario conductor")]
struct Cli {
    /// Conductor config (YAML); JOHANN_* variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Debug logging and full internal error messages.
    #[arg(long, global = true)]
    debug: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the hash of the agent code shipped to hosts.
    Codehash {
        /// Source root holding the agent code.
        #[arg(long)]
        root: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Build the agent bundle for the current code version.
    Bundle {
        #[arg(long)]
        root: Option<PathBuf>,
        /// Directory the bundle is written to.
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Check a score file without playing it.
    Validate {
        score: PathBuf,
        /// Extra task names to accept besides the built-in ones.
        #[arg(long = "task")]
        tasks: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Check a hosts file shaped like `{hosts: {name: descriptor}}`.
    HostsValidate {
        hosts: PathBuf,
        /// Report invalid entries without failing.
        #[arg(long)]
        allow_invalid: bool,
        #[arg(long)]
        json: bool,
    },
    /// Play a score to completion with every task run in this process.
    Play {
        score: PathBuf,
        #[arg(long)]
        hosts: Option<PathBuf>,
        /// Create hosts for players that map fewer hosts than their scale.
        #[arg(long)]
        create_hosts: bool,
        /// Use in-memory hosts named after the score's players' hosts.
        #[arg(long)]
        simulate: bool,
        /// Extra task names, served by a task that echoes its arguments.
        #[arg(long = "task")]
        tasks: Vec<String>,
        #[arg(long, default_value_t = 600)]
        timeout_seconds: u64,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env("JOHANN_LOG").unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_writer(std::io::stderr)
        .init();

    let json_mode = command_json_mode(&cli.command);
    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    let result = runtime.block_on(run_command(cli.config.as_deref(), cli.debug, cli.command));
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

async fn run_command(config_path: Option<&Path>, debug: bool, command: Commands) -> Result<Option<Value>> {
    let mut config = JohannConfig::load(config_path)?;
    config.debug |= debug;
    match command {
        Commands::Codehash { root, json } => {
            if let Some(root) = root {
                config.source_root = root;
            }
            let code = CodeVersion::from_config(&config)?;
            if json {
                return Ok(Some(json!({"ok": true, "command": "codehash", "codehash": code.codehash})));
            }
            println!("{}", code.codehash);
        }
        Commands::Bundle { root, out, json } => {
            if let Some(root) = root {
                config.source_root = root;
            }
            if let Some(out) = out {
                config.bundle_dir = out;
            }
            let code = CodeVersion::from_config(&config)?;
            let path = tokio::task::spawn_blocking(move || code.ensure_bundle()).await??;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "bundle",
                    "bundle": path.display().to_string()
                })));
            }
            println!("bundle: {}", path.display());
        }
        Commands::Validate { score, tasks, json } => {
            let conductor = Conductor::local(config, HostControlRegistry::new())?;
            register_echo_tasks(&conductor, &tasks);
            let raw = require_success(conductor.read_score_file(&score, false), "validate")?;
            if json {
                return Ok(Some(json!({"ok": true, "command": "validate", "score": raw})));
            }
            println!("score '{}' is valid", raw["name"].as_str().unwrap_or_default());
        }
        Commands::HostsValidate {
            hosts,
            allow_invalid,
            json,
        } => {
            let conductor = Conductor::local(config, HostControlRegistry::new())?;
            let response = conductor.read_hosts_file(&hosts);
            if !response.success && !allow_invalid {
                return Err(anyhow!("hosts-validate failed: {}", response.messages.join("; ")));
            }
            let valid = response.data.unwrap_or(Value::Null);
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "hosts-validate",
                    "hosts": valid,
                    "invalid": response.messages
                })));
            }
            for name in valid.as_array().into_iter().flatten() {
                println!("valid host: {}", name.as_str().unwrap_or_default());
            }
            for msg in &response.messages {
                println!("invalid: {}", msg);
            }
        }
        Commands::Play {
            score,
            hosts,
            create_hosts,
            simulate,
            tasks,
            timeout_seconds,
            json,
        } => {
            let options = PlayOptions {
                hosts: hosts.as_deref(),
                create_hosts,
                simulate,
                tasks: &tasks,
                timeout: Duration::from_secs(timeout_seconds),
            };
            let status = play(config, &score, options).await?;
            let succeeded = status["state"] == json!("SUCCESS");
            if json {
                return Ok(Some(json!({"ok": succeeded, "command": "play", "status": status})));
            }
            println!("{}", serde_json::to_string_pretty(&status)?);
            if !succeeded {
                return Err(anyhow!("score finished with state {}", status["state"]));
            }
        }
    }
    Ok(None)
}

struct PlayOptions<'a> {
    hosts: Option<&'a Path>,
    create_hosts: bool,
    simulate: bool,
    tasks: &'a [String],
    timeout: Duration,
}

async fn play(mut config: JohannConfig, score_path: &Path, options: PlayOptions<'_>) -> Result<Value> {
    let PlayOptions {
        hosts: hosts_path,
        create_hosts,
        simulate,
        tasks,
        timeout,
    } = options;
    let mut controls = HostControlRegistry::new();
    let memory = Arc::new(MemoryHostControl::new("MEMORY"));
    if simulate {
        config.default_control_method = "MEMORY".to_string();
        config.tuning.settle_ms = 0;
        config.tuning.agent_start_wait_ms = 0;
        controls.register(memory.clone());
    } else {
        controls.register(Arc::new(DockerHostControl::default()));
    }

    let conductor = Conductor::local(config, controls)?;
    register_echo_tasks(&conductor, tasks);
    if let Some(hosts_path) = hosts_path {
        require_success(conductor.read_hosts_file(hosts_path), "hosts")?;
    }
    let raw = require_success(conductor.read_score_file(score_path, false), "score")?;
    let name = raw["name"]
        .as_str()
        .ok_or_else(|| anyhow!("score '{}' has no name", score_path.display()))?
        .to_string();

    if simulate {
        if let Some(players) = raw["players"].as_object() {
            for host in players.values().filter_map(|p| p["hosts"].as_array()).flatten() {
                if let Some(host) = host.as_str() {
                    memory.add_host(host);
                }
            }
        }
    }

    let update = RollCallUpdate {
        create_hosts: create_hosts.then_some(true),
        ..RollCallUpdate::default()
    };
    let conductor = Arc::new(conductor);
    let roll_call = {
        let conductor = conductor.clone();
        let name = name.clone();
        tokio::task::spawn_blocking(move || conductor.affrettando(&name, Some(&update))).await?
    };
    require_success(roll_call, "play")?;
    let finished = conductor.wait_for(&name, timeout).await;
    require_success(finished, "play")?;
    require_success(conductor.score_status(&name, false), "status")
}

/// Echoes its arguments back as the task result.
struct EchoTask;

#[async_trait]
impl TaskHandler for EchoTask {
    async fn run(&self, ctx: TaskContext, args: Vec<Value>, kwargs: Map<String, Value>) -> Result<Value> {
        tracing::info!("{}: echo", ctx.description);
        Ok(json!({"args": args, "kwargs": kwargs}))
    }
}

fn register_echo_tasks(conductor: &Conductor, names: &[String]) {
    for name in names {
        conductor.register_task(name, Arc::new(EchoTask));
    }
}

fn require_success(response: JohannResponse, what: &str) -> Result<Value> {
    if response.success {
        return Ok(response.data.unwrap_or(Value::Null));
    }
    Err(anyhow!("{} failed: {}", what, response.messages.join("; ")))
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Codehash { json, .. }
        | Commands::Bundle { json, .. }
        | Commands::Validate { json, .. }
        | Commands::HostsValidate { json, .. }
        | Commands::Play { json, .. } => *json,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn play_flags_parse() {
        let cli = Cli::try_parse_from([
            "johann", "--config", "c.yaml", "play", "demo.yaml", "--simulate", "--task", "work", "--json",
            "--debug",
        ])
        .expect("parse");
        assert_eq!(cli.config, Some(PathBuf::from("c.yaml")));
        assert!(cli.debug);
        match cli.command {
            Commands::Play {
                create_hosts,
                simulate,
                tasks,
                timeout_seconds,
                json,
                ..
            } => {
                assert!(!create_hosts);
                assert!(simulate);
                assert_eq!(tasks, vec!["work".to_string()]);
                assert_eq!(timeout_seconds, 600);
                assert!(json);
            }
            _ => panic!("expected play"),
        }
    }

    #[test]
    fn failures_carry_messages() {
        let err = require_success(JohannResponse::failure(400, vec!["bad".to_string()]), "play")
            .expect_err("failure");
        assert_eq!(err.to_string(), "play failed: bad");
        assert_eq!(json_error("x", "m".to_string(), json!({}))["ok"], json!(false));
    }
}
