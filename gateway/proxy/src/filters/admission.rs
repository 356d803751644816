//! Validation of pod connect requests before they reach a kubelet.

use vcluster_gateway_core::request::query_pairs;
use vcluster_gateway_k8s_api::{Pod, StatusError};

/// The decoded options of a pod `exec` or `attach` request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectOptions {
    pub container: Option<String>,
    pub command: Vec<String>,
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
    pub tty: bool,
}

// === impl ConnectOptions ===

impl ConnectOptions {
    /// Reads options from a query string. `exec` defaults to capturing
    /// stdout and stderr when no stream is named.
    pub fn from_query(query: Option<&str>) -> Self {
        let mut opts = Self::default();
        for (key, value) in query_pairs(query) {
            let flag = value.is_empty() || value == "true" || value == "1";
            match key.as_ref() {
                "container" => opts.container = Some(value.into_owned()),
                "command" => opts.command.push(value.into_owned()),
                "stdin" | "input" => opts.stdin = flag,
                "stdout" | "output" => opts.stdout = flag,
                "stderr" | "error" => opts.stderr = flag,
                "tty" => opts.tty = flag,
                _ => {}
            }
        }
        opts
    }

    fn any_stream(&self) -> bool {
        self.stdin || self.stdout || self.stderr
    }
}

/// Checks a connect request against the pod it targets.
pub fn validate(pod: &Pod, subresource: &str, query: Option<&str>) -> Result<(), StatusError> {
    let name = pod.metadata.name.as_deref().unwrap_or_default();
    let phase = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or_default();

    if subresource == "portforward" {
        if phase != "Running" {
            return Err(StatusError::bad_request(format!(
                "pod {name} is not running and cannot be port forwarded; current phase is {phase}"
            )));
        }
        return Ok(());
    }

    if phase == "Succeeded" || phase == "Failed" {
        return Err(StatusError::bad_request(format!(
            "cannot {subresource} into a container in a completed pod; current phase is {phase}"
        )));
    }

    let opts = ConnectOptions::from_query(query);
    let containers = pod
        .spec
        .as_ref()
        .map(|s| {
            s.containers
                .iter()
                .chain(s.init_containers.iter().flatten())
                .map(|c| c.name.as_str())
                .chain(
                    s.ephemeral_containers
                        .iter()
                        .flatten()
                        .map(|c| c.name.as_str()),
                )
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    match opts.container.as_deref() {
        Some(container) if !containers.contains(&container) => {
            return Err(StatusError::bad_request(format!(
                "container {container} is not valid for pod {name}"
            )));
        }
        Some(_) => {}
        // A single container is the default; otherwise the client must pick one.
        None if containers.len() == 1 => {}
        None => {
            return Err(StatusError::bad_request(format!(
                "a container name must be specified for pod {name}, choose one of: [{}]",
                containers.join(" ")
            )));
        }
    }

    if !opts.any_stream() {
        return Err(StatusError::bad_request(
            "you must specify at least 1 of stdin, stdout, stderr",
        ));
    }
    if subresource == "exec" && opts.command.is_empty() {
        return Err(StatusError::bad_request("you must specify at least one command for the container"));
    }
    Ok(())
}
