use super::{CommandRunner, ExecOutcome};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::AttachParams;
use kube::{Api, Client};
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, instrument, warn};

/// Runs commands in a sibling container of the current pod via `pods/exec`
#[derive(Clone)]
pub struct RemoteExecutor {
    pods: Api<Pod>,
    pod_name: String,
    container: String,
}

impl RemoteExecutor {
    pub fn new(client: Client, namespace: &str, pod_name: impl Into<String>, container: impl Into<String>) -> Self {
        Self {
            pods: Api::namespaced(client, namespace),
            pod_name: pod_name.into(),
            container: container.into(),
        }
    }
}

#[async_trait]
impl CommandRunner for RemoteExecutor {
    #[instrument(skip(self, argv), fields(pod = %self.pod_name, container = %self.container, program = %argv.first().map(String::as_str).unwrap_or_default()))]
    async fn run(&self, argv: &[String], timeout: Duration) -> ExecOutcome {
        let params = AttachParams::default()
            .container(self.container.as_str())
            .stdin(false)
            .stdout(true)
            .stderr(true);

        let mut attached = match self.pods.exec(&self.pod_name, argv.to_vec(), &params).await {
            Ok(attached) => attached,
            Err(e) => {
                warn!(error = %e, "exec request failed");
                return ExecOutcome::failed(format!("exec into {} failed: {e}", self.container));
            }
        };

        let stdout = attached.stdout();
        let stderr = attached.stderr();
        let status = attached.take_status();

        let outcome = collect_output(stdout, stderr, status, timeout).await;
        if outcome.timed_out {
            info!(timeout_secs = timeout.as_secs(), "command timed out, aborting");
            attached.abort();
        } else if let Err(e) = attached.join().await {
            debug!(error = %e, "exec stream closed with error");
        }
        outcome
    }
}

/// Drains both output streams and waits for the final status, bounded by `timeout`
///
/// On timeout whatever was read so far is kept and the exit code is -1.
async fn collect_output<O, E, S>(
    stdout: Option<O>,
    stderr: Option<E>,
    status: Option<S>,
    timeout: Duration,
) -> ExecOutcome
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
    S: Future<Output = Option<Status>>,
{
    let mut stdout_buf = Vec::new();
    let mut stderr_buf = Vec::new();
    let finished = tokio::time::timeout(timeout, async {
        let (_, _, status) = tokio::join!(
            drain(stdout, &mut stdout_buf),
            drain(stderr, &mut stderr_buf),
            async {
                match status {
                    Some(status) => status.await,
                    None => None,
                }
            }
        );
        status
    })
    .await;

    let mut outcome = ExecOutcome {
        stdout: String::from_utf8_lossy(&stdout_buf).into_owned(),
        stderr: String::from_utf8_lossy(&stderr_buf).into_owned(),
        ..Default::default()
    };

    match finished {
        Ok(status) => {
            let (exit_code, error) = exit_code_from_status(status.as_ref());
            outcome.exit_code = exit_code;
            outcome.error = error;
        }
        Err(_) => {
            outcome.exit_code = -1;
            outcome.timed_out = true;
            outcome.error = Some(format!("command timed out after {}s", timeout.as_secs()));
        }
    }
    outcome
}

async fn drain<R>(reader: Option<R>, sink: &mut Vec<u8>)
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return;
    };
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => sink.extend_from_slice(&chunk[..n]),
            Err(e) => {
                debug!(error = %e, "exec stream read failed");
                break;
            }
        }
    }
}

/// Maps the exec API's final `Status` onto an exit code
///
/// A missing status means the stream ended before the process did.
pub fn exit_code_from_status(status: Option<&Status>) -> (i32, Option<String>) {
    let Some(status) = status else {
        return (-1, Some("exec stream ended without a status".to_string()));
    };

    if status.status.as_deref() == Some("Success") {
        return (0, None);
    }

    let exit_code = status
        .details
        .as_ref()
        .and_then(|d| d.causes.as_ref())
        .and_then(|causes| {
            causes
                .iter()
                .find(|c| c.reason.as_deref() == Some("ExitCode"))
        })
        .and_then(|cause| cause.message.as_deref())
        .and_then(|message| message.trim().parse::<i32>().ok());

    match exit_code {
        // A plain non-zero exit is the command's business, not an exec error
        Some(code) => (code, None),
        None => (1, status.message.clone()),
    }
}
