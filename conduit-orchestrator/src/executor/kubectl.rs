//! Kubernetes executor
//!
//! Submits each job as a `batch/v1` Job through the `kubectl` binary and reads
//! `.status` back from `kubectl get job -o json`. Handles are `namespace/name`.
//! Stage services become `v1` Services selecting the jobs' pods.

use async_trait::async_trait;
use conduit_core::domain::job::{JobHandle, RawJobStatus};
use serde::Deserialize;
use serde_json::{Value, json};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, error};

use super::{ExecutorError, JobExecutor, JobSubmission, ServiceSubmission};

/// Executor backed by `kubectl`
pub struct KubectlExecutor {
    binary: String,
}

#[derive(Debug, Deserialize)]
struct JobObject {
    #[serde(default)]
    status: RawJobStatus,
}

impl KubectlExecutor {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Runs kubectl with optional stdin and returns stdout
    async fn run(&self, args: &[&str], stdin: Option<&[u8]>) -> Result<Vec<u8>, ExecutorError> {
        let mut child = Command::new(&self.binary)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ExecutorError::Unavailable(format!("cannot run {}: {}", self.binary, e)))?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input).await?;
            drop(pipe);
        }

        let output = child.wait_with_output().await?;
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !stderr.trim().is_empty() {
            debug!("kubectl {} stderr: {}", args.join(" "), stderr.trim());
        }

        if !output.status.success() {
            let exit_code = output.status.code().unwrap_or(-1);
            error!(
                "kubectl {} failed: exit_code={}, stderr='{}'",
                args.join(" "),
                exit_code,
                stderr.trim()
            );
            return Err(ExecutorError::Rejected(stderr.trim().to_string()));
        }

        Ok(output.stdout)
    }
}

#[async_trait]
impl JobExecutor for KubectlExecutor {
    async fn submit(&self, job: &JobSubmission) -> Result<JobHandle, ExecutorError> {
        let manifest = serde_json::to_vec(&job_manifest(job))
            .map_err(|e| ExecutorError::InvalidResponse(e.to_string()))?;

        let namespace = namespace_arg(&job.namespace);
        self.run(&[&namespace, "apply", "-f", "-"], Some(&manifest))
            .await?;

        debug!("Submitted kubernetes job {}", job.name);
        Ok(handle_for(&job.namespace, &job.name))
    }

    async fn status(&self, handle: &JobHandle) -> Result<RawJobStatus, ExecutorError> {
        let (namespace, name) = split_handle(handle)?;
        let namespace = namespace_arg(namespace);

        let stdout = self
            .run(&[&namespace, "get", "job", name, "-o", "json"], None)
            .await
            .map_err(|e| match e {
                ExecutorError::Rejected(msg) if msg.contains("NotFound") => {
                    ExecutorError::NotFound(handle.clone())
                }
                other => other,
            })?;

        let object: JobObject = serde_json::from_slice(&stdout)
            .map_err(|e| ExecutorError::InvalidResponse(e.to_string()))?;
        Ok(object.status)
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<(), ExecutorError> {
        let (namespace, name) = split_handle(handle)?;
        let namespace = namespace_arg(namespace);

        self.run(
            &[&namespace, "delete", "job", name, "--ignore-not-found"],
            None,
        )
        .await?;
        Ok(())
    }

    async fn expose(&self, service: &ServiceSubmission) -> Result<(), ExecutorError> {
        let manifest = serde_json::to_vec(&service_manifest(service))
            .map_err(|e| ExecutorError::InvalidResponse(e.to_string()))?;

        let namespace = namespace_arg(&service.namespace);
        self.run(&[&namespace, "apply", "-f", "-"], Some(&manifest))
            .await?;

        debug!("Exposed kubernetes service {}", service.name);
        Ok(())
    }
}

fn namespace_or_default(namespace: &str) -> &str {
    if namespace.is_empty() {
        "default"
    } else {
        namespace
    }
}

fn namespace_arg(namespace: &str) -> String {
    format!("--namespace={}", namespace_or_default(namespace))
}

fn handle_for(namespace: &str, name: &str) -> JobHandle {
    JobHandle(format!("{}/{}", namespace_or_default(namespace), name))
}

fn split_handle(handle: &JobHandle) -> Result<(&str, &str), ExecutorError> {
    handle
        .0
        .split_once('/')
        .filter(|(ns, name)| !ns.is_empty() && !name.is_empty())
        .ok_or_else(|| ExecutorError::InvalidResponse(format!("malformed job handle {}", handle)))
}

/// Renders the `batch/v1` Job object for a submission
///
/// Template fields the engine does not interpret are merged into the
/// container definition.
fn job_manifest(job: &JobSubmission) -> Value {
    let env: Vec<Value> = job
        .env
        .iter()
        .map(|(name, value)| json!({ "name": name, "value": value }))
        .collect();

    let mut container = json!({
        "name": job.job_name.to_lowercase().replace('_', "-"),
        "image": job.image,
        "args": job.args,
        "env": env,
    });

    if let Value::Object(fields) = &mut container {
        for (key, value) in &job.extra {
            fields.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }

    json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": {
            "name": job.name,
            "namespace": namespace_or_default(&job.namespace),
            "labels": job.labels,
        },
        "spec": {
            "completions": job.completions,
            "parallelism": job.parallelism,
            "template": {
                "metadata": { "labels": job.labels },
                "spec": {
                    "restartPolicy": "Never",
                    "containers": [container],
                },
            },
        },
    })
}

fn service_manifest(service: &ServiceSubmission) -> Value {
    let ports: Vec<Value> = service
        .ports
        .iter()
        .map(|(name, port)| {
            let mut entry = json!({ "port": port, "targetPort": port });
            if !name.is_empty() {
                entry["name"] = json!(name);
            }
            entry
        })
        .collect();

    json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "name": service.name,
            "namespace": namespace_or_default(&service.namespace),
            "labels": service.labels,
        },
        "spec": {
            "selector": service.selector,
            "ports": ports,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn submission() -> JobSubmission {
        let mut labels = BTreeMap::new();
        labels.insert("conduit/pipeline".to_string(), "etl".to_string());

        let mut extra = BTreeMap::new();
        extra.insert("resources".to_string(), json!({"limits": {"cpu": "1"}}));
        extra.insert("image".to_string(), json!("ignored"));

        JobSubmission {
            name: "etl-3-shard-a".to_string(),
            job_name: "shard_a".to_string(),
            namespace: String::new(),
            image: "busybox".to_string(),
            args: vec!["echo".to_string(), "hi".to_string()],
            env: BTreeMap::from([("MODE".to_string(), "full".to_string())]),
            completions: 3,
            parallelism: 2,
            labels,
            extra,
        }
    }

    #[test]
    fn test_job_manifest() {
        let manifest = job_manifest(&submission());

        assert_eq!(manifest["kind"], "Job");
        assert_eq!(manifest["metadata"]["name"], "etl-3-shard-a");
        assert_eq!(manifest["metadata"]["namespace"], "default");
        assert_eq!(manifest["metadata"]["labels"]["conduit/pipeline"], "etl");
        assert_eq!(manifest["spec"]["completions"], 3);
        assert_eq!(manifest["spec"]["parallelism"], 2);

        let container = &manifest["spec"]["template"]["spec"]["containers"][0];
        assert_eq!(container["name"], "shard-a");
        assert_eq!(container["image"], "busybox");
        assert_eq!(container["env"][0]["name"], "MODE");
        assert_eq!(container["resources"]["limits"]["cpu"], "1");
    }

    #[test]
    fn test_service_manifest() {
        let service = ServiceSubmission {
            name: "etl-3-shard-api".to_string(),
            namespace: "batch".to_string(),
            ports: vec![("http".to_string(), 8080), (String::new(), 9090)],
            selector: BTreeMap::from([
                ("conduit/instance".to_string(), "3".to_string()),
                ("conduit/job".to_string(), "a".to_string()),
            ]),
            labels: BTreeMap::from([("conduit/pipeline".to_string(), "etl".to_string())]),
        };

        let manifest = service_manifest(&service);
        assert_eq!(manifest["kind"], "Service");
        assert_eq!(manifest["metadata"]["name"], "etl-3-shard-api");
        assert_eq!(manifest["metadata"]["namespace"], "batch");
        assert_eq!(manifest["spec"]["selector"]["conduit/job"], "a");
        assert_eq!(manifest["spec"]["ports"][0]["name"], "http");
        assert_eq!(manifest["spec"]["ports"][0]["targetPort"], 8080);
        assert!(manifest["spec"]["ports"][1].get("name").is_none());
        assert_eq!(manifest["spec"]["ports"][1]["port"], 9090);
    }

    #[test]
    fn test_handles() {
        let handle = handle_for("", "etl-1-a");
        assert_eq!(handle.0, "default/etl-1-a");
        assert_eq!(split_handle(&handle).unwrap(), ("default", "etl-1-a"));

        let bad = JobHandle("no-namespace".to_string());
        assert!(split_handle(&bad).is_err());
    }

    #[test]
    fn test_status_from_job_object() {
        let json = r#"{
            "metadata": {"name": "etl-1-a"},
            "status": {
                "failed": 2,
                "startTime": "2016-08-11T15:00:00Z",
                "conditions": [{"type": "Failed", "status": "True", "reason": "BackoffLimitExceeded"}]
            }
        }"#;

        let object: JobObject = serde_json::from_str(json).unwrap();
        assert_eq!(object.status.failed, 2);
        assert_eq!(object.status.active, 0);
        assert_eq!(
            object.status.conditions[0].reason.as_deref(),
            Some("BackoffLimitExceeded")
        );
    }
}
