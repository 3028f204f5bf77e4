use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use keel_boot::{BootstrapOrchestrator, TopologyHealthChecker};
use keel_core::config::BootstrapConfig;
use keel_core::plan::ProvisionPlan;
use keel_core::{allocate, topology, ClusterSpec};
use keel_kubehub::KubeControlPlane;
use keel_ops::KubeExecAdmin;
use keel_persist::{AuditStore, SqliteStore};
use tracing::{info, warn};

mod lease;

#[derive(Parser, Debug)]
#[command(name = "keelctl", version, about = "Bootstrap replicated data stores on Kubernetes")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Retry/timeout settings (YAML); KEEL_* env vars override it
    #[arg(long = "config", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Provision, initiate and verify the cluster described by a spec file
    Bootstrap {
        /// Cluster spec (YAML)
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
        /// Scope lease lifetime in seconds; renewed every third of it while the run lasts
        #[arg(long = "lease-ttl", default_value_t = 120)]
        lease_ttl: i64,
    },
    /// Print the member identities a spec allocates
    Members {
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
    },
    /// Print the resources a spec provisions, tier by tier
    Plan {
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
    },
    /// Observe replication health of an existing cluster
    Health {
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
    },
    /// Show recorded phase transitions for a scope
    Audit {
        #[arg(long = "scope")]
        scope: String,
        #[arg(long = "limit", default_value_t = 50)]
        limit: usize,
    },
}

fn init_tracing() {
    let env = std::env::var("KEEL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KEEL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KEEL_METRICS_ADDR; expected host:port");
        }
    }
}

fn load_spec(path: &Path) -> Result<ClusterSpec> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let spec: ClusterSpec = serde_yaml::from_str(&text).with_context(|| format!("parsing cluster spec {}", path.display()))?;
    spec.validate()?;
    Ok(spec)
}

/// Defaults, then the YAML file, then `KEEL_*` overrides.
fn load_config(path: Option<&Path>, lookup: impl Fn(&str) -> Option<String>) -> Result<BootstrapConfig> {
    let mut cfg = match path {
        Some(p) => {
            let text = std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
            serde_yaml::from_str(&text).with_context(|| format!("parsing config {}", p.display()))?
        }
        None => BootstrapConfig::default(),
    };
    cfg.apply_overrides(lookup);
    Ok(cfg)
}

fn print_json<T: serde::Serialize>(v: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Members { file } => {
            let spec = load_spec(&file)?;
            let members = allocate(&spec);
            match cli.output {
                Output::Human => {
                    for m in &members {
                        println!("{}\t{}\t{}", m.ordinal, m.stable_name, m.endpoint(spec.data_port));
                    }
                }
                Output::Json => print_json(&members)?,
            }
        }
        Commands::Plan { file } => {
            let spec = load_spec(&file)?;
            let plan = ProvisionPlan::for_cluster(&spec);
            match cli.output {
                Output::Human => {
                    for (i, tier) in plan.tiers.iter().enumerate() {
                        let keys: Vec<String> = tier.iter().map(|d| d.key.to_string()).collect();
                        println!("tier {}: {}", i + 1, keys.join(", "));
                    }
                }
                Output::Json => print_json(&plan)?,
            }
        }
        Commands::Health { file } => {
            let spec = load_spec(&file)?;
            let cfg = load_config(cli.config.as_deref(), |k| std::env::var(k).ok())?;
            let admin = Arc::new(KubeExecAdmin::try_default(spec.data_port).await?);
            let checker = TopologyHealthChecker::new(admin, cfg.health.grace());
            let t = topology(&spec);
            let h = checker.check(&t).await;
            match cli.output {
                Output::Human => {
                    println!("{:?}", h.state);
                    for m in &t.members {
                        let role = h.per_member_role.get(&m.ordinal).map(|r| format!("{:?}", r)).unwrap_or_else(|| "-".into());
                        println!("  {}\t{}", m.address, role);
                    }
                }
                Output::Json => print_json(&h)?,
            }
        }
        Commands::Audit { scope, limit } => {
            let store = SqliteStore::open_default()?;
            let rows = store.history(&scope, Some(limit))?;
            match cli.output {
                Output::Human => {
                    for r in rows {
                        let err = match (&r.error_kind, &r.error) {
                            (Some(k), Some(e)) => format!("  [{}] {}", k, e),
                            _ => String::new(),
                        };
                        println!("{}\t{}\t{} -> {}\tattempt {}{}", r.ts, r.run_id, r.from_phase, r.to_phase, r.attempt, err);
                    }
                }
                Output::Json => print_json(&rows)?,
            }
        }
        Commands::Bootstrap { file, lease_ttl } => {
            let spec = load_spec(&file)?;
            let cfg = load_config(cli.config.as_deref(), |k| std::env::var(k).ok())?;
            return bootstrap(spec, cfg, lease_ttl, cli.output).await;
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn bootstrap(spec: ClusterSpec, cfg: BootstrapConfig, lease_ttl: i64, output: Output) -> Result<ExitCode> {
    let store = Arc::new(SqliteStore::open_default()?);
    let plane = Arc::new(KubeControlPlane::try_default().await?);
    let admin = Arc::new(KubeExecAdmin::try_default(spec.data_port).await?);
    let orch = BootstrapOrchestrator::new(plane, admin, cfg).with_audit(store.clone());

    let holder = uuid::Uuid::new_v4().to_string();
    let scope = spec.scope.clone();
    let run = lease::with_lease(store, &scope, &holder, lease_ttl, |cancel| async move {
        let on_signal = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Ctrl-C received; cancelling bootstrap");
                on_signal.cancel();
            }
        });
        Ok(orch.run(spec, cancel).await)
    })
    .await?;
    info!(run_id = %run.run_id, phase = %run.phase, "bootstrap finished");

    match output {
        Output::Human => println!("{}", run.summary()),
        Output::Json => print_json(&run)?,
    }
    Ok(if run.succeeded() { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn temp_file(name: &str, body: &str) -> PathBuf {
        let p = std::env::temp_dir().join(format!("keelctl-{}-{}", uuid::Uuid::new_v4(), name));
        std::fs::write(&p, body).unwrap();
        p
    }

    #[test]
    fn cli_parses_bootstrap() {
        let cli = Cli::try_parse_from(["keelctl", "-o", "json", "bootstrap", "-f", "c.yaml"]).unwrap();
        assert_eq!(cli.output, Output::Json);
        assert!(matches!(cli.command, Commands::Bootstrap { lease_ttl: 120, .. }));
    }

    #[test]
    fn spec_file_fills_defaults() {
        let p = temp_file("cluster.yaml", "scope: test\nmembers: 3\ncomputeClass: m5.large\nstorageSize: 10Gi\n");
        let spec = load_spec(&p).unwrap();
        assert_eq!(spec.replication_set_id, "rs0");
        assert_eq!(spec.data_port, 27017);
        assert_eq!(spec.storage_class_name(), "test-sc");
    }

    #[test]
    fn invalid_spec_file_is_rejected() {
        let p = temp_file("bad.yaml", "scope: Test_1\nmembers: 3\ncomputeClass: m5.large\nstorageSize: 10Gi\n");
        assert!(load_spec(&p).is_err());
    }

    #[test]
    fn env_overrides_file_overrides_defaults() {
        let p = temp_file("cfg.yaml", "provision:\n  maxAttempts: 9\nhealth:\n  deadlineMs: 1000\n");
        let env: HashMap<&str, &str> = [("KEEL_HEALTH_DEADLINE_SECS", "42")].into_iter().collect();
        let cfg = load_config(Some(&p), |k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(cfg.provision.max_attempts, 9);
        assert_eq!(cfg.provision.base_delay_ms, 1_000);
        assert_eq!(cfg.health.deadline_ms, 42_000);
        let plain = load_config(None, |_| None).unwrap();
        assert_eq!(plain, BootstrapConfig::default());
    }
}
