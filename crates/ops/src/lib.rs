//! Keel Ops: the replication admin channel.
//!
//! Every command runs `mongosh --quiet --eval <script>` inside the member's pod through the
//! exec subresource. Scripts catch their own errors and print exactly one JSON envelope,
//! so all interpretation happens in the pure functions below.

#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::StreamExt;
use keel_core::allocate::{parse_address, stable_name};
use keel_core::ports::{AdminChannel, ReplicationStatus};
use keel_core::{AdminError, MemberRole, TopologySpec};
use kube::{api::{Api, AttachParams}, Client};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Server code for "no replication config yet".
const NOT_YET_INITIALIZED: i64 = 94;
/// Server code for "already initialized".
const ALREADY_INITIALIZED: i64 = 23;

/// Captured output of one command run in a pod.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs a command in a pod and captures its output.
#[async_trait]
pub trait PodExec: Send + Sync {
    async fn exec(&self, namespace: &str, pod: &str, cmd: Vec<String>) -> Result<ExecOutput>;
}

/// [`PodExec`] over the Kubernetes exec subresource.
pub struct KubePodExec {
    client: Client,
    container: Option<String>,
}

impl KubePodExec {
    pub fn new(client: Client, container: Option<String>) -> Self { Self { client, container } }
}

#[async_trait]
impl PodExec for KubePodExec {
    async fn exec(&self, namespace: &str, pod: &str, cmd: Vec<String>) -> Result<ExecOutput> {
        use k8s_openapi::api::core::v1::Pod;

        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let mut ap = AttachParams::default().stdin(false).stdout(true).stderr(true);
        if let Some(c) = &self.container { ap = ap.container(c.as_str()); }
        let mut attached = api.exec(pod, cmd, &ap).await?;

        let out = attached.stdout().ok_or_else(|| anyhow!("exec stdout missing"))?;
        let err = attached.stderr().ok_or_else(|| anyhow!("exec stderr missing"))?;
        let (stdout, stderr) = tokio::join!(drain(out), drain(err));
        attached.join().await?;
        Ok(ExecOutput { stdout, stderr })
    }
}

async fn drain<R: tokio::io::AsyncRead + Unpin>(reader: R) -> String {
    let mut stream = tokio_util::io::ReaderStream::new(reader);
    let mut buf = Vec::new();
    while let Some(Ok(bytes)) = stream.next().await { buf.extend_from_slice(&bytes); }
    String::from_utf8_lossy(&buf).into_owned()
}

/// [`AdminChannel`] that talks to each member through its own pod.
///
/// Addresses are `member-<n>.<scope>`; the pod is `member-<n>` in namespace `<scope>`.
pub struct KubeExecAdmin<E: PodExec = KubePodExec> {
    exec: E,
    port: u16,
    timeout: Duration,
}

impl KubeExecAdmin<KubePodExec> {
    /// Admin over the ambient kube client, exec'ing into the data-store container.
    pub async fn try_default(port: u16) -> Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self::with_exec(KubePodExec::new(client, Some(keel_core::DATA_CONTAINER.to_string())), port))
    }
}

impl<E: PodExec> KubeExecAdmin<E> {
    pub fn with_exec(exec: E, port: u16) -> Self {
        let secs = std::env::var("KEEL_EXEC_TIMEOUT_SECS").ok().and_then(|s| s.parse().ok()).unwrap_or(20);
        Self { exec, port, timeout: Duration::from_secs(secs) }
    }

    pub fn timeout(mut self, t: Duration) -> Self {
        self.timeout = t;
        self
    }

    async fn eval(&self, address: &str, op: &'static str, script: String) -> Result<Envelope, AdminError> {
        let (ordinal, scope) = parse_address(address)
            .ok_or_else(|| AdminError::Rejected(format!("{} is not a member address", address)))?;
        let pod = stable_name(ordinal);
        let cmd = mongosh(self.port, script);
        let started = std::time::Instant::now();
        let res = tokio::time::timeout(self.timeout, self.exec.exec(scope, &pod, cmd)).await;
        histogram!("ops_exec_ms", started.elapsed().as_secs_f64() * 1000.0, "op" => op);
        let out = match res {
            Ok(Ok(out)) => out,
            Ok(Err(e)) => {
                counter!("ops_exec_errors_total", 1u64, "op" => op);
                return Err(AdminError::Unreachable(format!("{}: exec failed: {:#}", address, e)));
            }
            Err(_) => {
                counter!("ops_exec_errors_total", 1u64, "op" => op);
                return Err(AdminError::Unreachable(format!("{}: no answer within {:?}", address, self.timeout)));
            }
        };
        match parse_envelope(&out.stdout) {
            Some(env) => Ok(env),
            // mongosh prints nothing parseable when it cannot connect at all
            None => Err(AdminError::Unreachable(format!("{}: {}", address, first_line(&out.stderr).unwrap_or("no output")))),
        }
    }
}

#[async_trait]
impl<E: PodExec> AdminChannel for KubeExecAdmin<E> {
    async fn ping(&self, address: &str) -> Result<(), AdminError> {
        let env = self.eval(address, "ping", PING_SCRIPT.to_string()).await?;
        if env.is_ok() {
            Ok(())
        } else {
            Err(AdminError::Unreachable(format!("{}: {}", address, env.errmsg.unwrap_or_default())))
        }
    }

    async fn replication_status(&self, address: &str) -> Result<ReplicationStatus, AdminError> {
        let env = self.eval(address, "status", STATUS_SCRIPT.to_string()).await?;
        let st = status_from(env)?;
        debug!(address, status = ?st, "replication status");
        Ok(st)
    }

    async fn initiate(&self, seed_address: &str, topology: &TopologySpec) -> Result<(), AdminError> {
        let cfg = initiate_config(topology, self.port);
        info!(seed = seed_address, config = %cfg, "rs.initiate");
        let env = self.eval(seed_address, "initiate", initiate_script(&cfg)).await?;
        let res = initiate_result(env);
        if let Err(e) = &res {
            warn!(seed = seed_address, error = %e, "rs.initiate refused");
        }
        res
    }
}

const PING_SCRIPT: &str = r#"try { const r = db.adminCommand({ ping: 1 }); print(JSON.stringify({ ok: r.ok })); } catch (e) { print(JSON.stringify({ ok: 0, code: e.code || 0, errmsg: String(e.message) })); }"#;

const STATUS_SCRIPT: &str = r#"try { const s = rs.status(); print(JSON.stringify({ ok: 1, set: s.set, myState: s.myState, members: s.members.map(m => ({ name: m.name, stateStr: m.stateStr, self: !!m.self })) })); } catch (e) { print(JSON.stringify({ ok: 0, code: e.code || 0, errmsg: String(e.message) })); }"#;

fn initiate_script(cfg: &serde_json::Value) -> String {
    format!(
        r#"try {{ const r = rs.initiate({}); print(JSON.stringify({{ ok: r.ok, code: r.code || 0, errmsg: r.errmsg || "" }})); }} catch (e) {{ print(JSON.stringify({{ ok: 0, code: e.code || 0, errmsg: String(e.message) }})); }}"#,
        cfg
    )
}

fn mongosh(port: u16, script: String) -> Vec<String> {
    vec!["mongosh".into(), "--quiet".into(), "--port".into(), port.to_string(), "--eval".into(), script]
}

/// One script answer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Envelope {
    pub ok: f64,
    pub code: i64,
    pub errmsg: Option<String>,
    pub set: Option<String>,
    pub my_state: Option<i64>,
    pub members: Vec<EnvelopeMember>,
}

impl Envelope {
    pub fn is_ok(&self) -> bool { self.ok >= 1.0 }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EnvelopeMember {
    pub name: String,
    pub state_str: String,
    #[serde(rename = "self")]
    pub is_self: bool,
}

/// Last JSON object line of the output; shell banners and warnings are skipped.
pub fn parse_envelope(stdout: &str) -> Option<Envelope> {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .filter(|l| l.starts_with('{'))
        .find_map(|l| serde_json::from_str(l).ok())
}

pub fn status_from(env: Envelope) -> Result<ReplicationStatus, AdminError> {
    if !env.is_ok() {
        return match env.code {
            NOT_YET_INITIALIZED => Ok(ReplicationStatus::NotInitialized),
            _ => Err(AdminError::Rejected(format!("rs.status failed ({}): {}", env.code, env.errmsg.unwrap_or_default()))),
        };
    }
    let set_id = env.set.ok_or_else(|| AdminError::Rejected("rs.status answered without a set name".into()))?;
    let self_role = env
        .members
        .iter()
        .find(|m| m.is_self)
        .map(|m| role_from_state_str(&m.state_str))
        .or_else(|| env.my_state.map(role_from_state_code))
        .unwrap_or(MemberRole::Unknown);
    let members = env.members.iter().map(|m| strip_port(&m.name).to_string()).collect();
    Ok(ReplicationStatus::Initialized { set_id, members, self_role })
}

pub fn initiate_result(env: Envelope) -> Result<(), AdminError> {
    if env.is_ok() {
        return Ok(());
    }
    match env.code {
        ALREADY_INITIALIZED => Err(AdminError::AlreadyInitialized),
        _ => Err(AdminError::Rejected(format!("rs.initiate failed ({}): {}", env.code, env.errmsg.unwrap_or_default()))),
    }
}

pub fn role_from_state_str(s: &str) -> MemberRole {
    match s {
        "PRIMARY" => MemberRole::Primary,
        "SECONDARY" => MemberRole::Secondary,
        "STARTUP" | "STARTUP2" | "RECOVERING" => MemberRole::Startup,
        _ => MemberRole::Unknown,
    }
}

/// Numeric `myState` as reported by `rs.status()`.
fn role_from_state_code(code: i64) -> MemberRole {
    match code {
        1 => MemberRole::Primary,
        2 => MemberRole::Secondary,
        0 | 3 | 5 => MemberRole::Startup,
        _ => MemberRole::Unknown,
    }
}

/// `member-0.test:27017` -> `member-0.test`.
pub fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((h, p)) if !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()) => h,
        _ => host,
    }
}

/// Replica set config: member `_id` is the ordinal, host is `address:port`.
pub fn initiate_config(topology: &TopologySpec, port: u16) -> serde_json::Value {
    serde_json::json!({
        "_id": topology.replication_set_id,
        "members": topology
            .members
            .iter()
            .map(|m| serde_json::json!({"_id": m.ordinal, "host": m.endpoint(port)}))
            .collect::<Vec<_>>(),
    })
}

fn first_line(s: &str) -> Option<&str> {
    s.lines().map(str::trim).find(|l| !l.is_empty())
}
