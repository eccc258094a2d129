//! In-memory marketplace and remote shell for unit tests

use crate::catalog::{GpuOffer, Location};
use crate::error::{OrchestratorError, Result};
use crate::instance::{ConnectionEndpoint, Instance, InstanceStatus, PortMapping, ProvisioningRequest};
use crate::provider::GpuMarketplace;
use crate::remote::{ProcessHandle, RemoteExit, RemoteProcess, RemoteShell};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

pub fn offer(model: &str, max_count: u32, port_forwarding: bool) -> GpuOffer {
    GpuOffer {
        model: model.to_string(),
        display_name: None,
        max_count,
        price_per_hour: Some(0.35),
        port_forwarding,
    }
}

pub fn location(id: &str, name: &str, gpus: Vec<GpuOffer>) -> Location {
    Location {
        id: id.to_string(),
        name: name.to_string(),
        gpus,
    }
}

pub fn instance_with(
    id: &str,
    status: InstanceStatus,
    ip_address: Option<&str>,
    ports: &[(u16, u16)],
) -> Instance {
    Instance {
        id: id.to_string(),
        name: format!("ComfyUI-{}", id),
        status,
        ip_address: ip_address.map(str::to_string),
        port_forwards: ports
            .iter()
            .map(|&(internal_port, external_port)| PortMapping {
                internal_port,
                external_port,
            })
            .collect(),
        resources: None,
        created_at: None,
    }
}

type Scripted = std::result::Result<Instance, (u16, String)>;

/// Scripted [`GpuMarketplace`]
#[derive(Default)]
pub struct MockMarketplace {
    locations: Vec<Location>,
    location_failure: Option<(u16, String)>,
    location_queries: AtomicUsize,

    creation_failure: Option<(u16, String)>,
    created: Mutex<Vec<(ProvisioningRequest, String)>>,

    // get_instance replies in order; the last one repeats
    responses: Mutex<VecDeque<Scripted>>,
    details: HashMap<String, Instance>,
    status_reads: AtomicUsize,

    instances: Vec<Instance>,
    list_details: bool,

    delete_failures: HashMap<String, (u16, String)>,
    deleted: Mutex<Vec<String>>,
}

impl MockMarketplace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_locations(mut self, locations: Vec<Location>) -> Self {
        self.locations = locations;
        self
    }

    pub fn fail_locations(mut self, status: u16, message: &str) -> Self {
        self.location_failure = Some((status, message.to_string()));
        self
    }

    pub fn reject_creation(mut self, status: u16, message: &str) -> Self {
        self.creation_failure = Some((status, message.to_string()));
        self
    }

    pub fn with_instance_states(self, states: Vec<Instance>) -> Self {
        self.with_instance_responses(states.into_iter().map(Ok).collect())
    }

    pub fn with_instance_responses(mut self, responses: Vec<Scripted>) -> Self {
        self.responses = Mutex::new(responses.into());
        self
    }

    pub fn with_instance_detail(mut self, instance: Instance) -> Self {
        self.details.insert(instance.id.clone(), instance);
        self
    }

    pub fn with_instances(mut self, instances: Vec<Instance>, includes_details: bool) -> Self {
        self.instances = instances;
        self.list_details = includes_details;
        self
    }

    pub fn fail_delete(mut self, id: &str, status: u16, message: &str) -> Self {
        self.delete_failures
            .insert(id.to_string(), (status, message.to_string()));
        self
    }

    pub fn location_queries(&self) -> usize {
        self.location_queries.load(Ordering::SeqCst)
    }

    pub fn created_requests(&self) -> Vec<(ProvisioningRequest, String)> {
        self.created.lock().unwrap().clone()
    }

    pub fn status_reads(&self) -> usize {
        self.status_reads.load(Ordering::SeqCst)
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl GpuMarketplace for MockMarketplace {
    async fn list_locations(&self) -> Result<Vec<Location>> {
        self.location_queries.fetch_add(1, Ordering::SeqCst);
        match &self.location_failure {
            Some((status, message)) => Err(OrchestratorError::api(*status, message.clone())),
            None => Ok(self.locations.clone()),
        }
    }

    async fn create_instance(
        &self,
        request: &ProvisioningRequest,
        location_id: &str,
    ) -> Result<Instance> {
        self.created
            .lock()
            .unwrap()
            .push((request.clone(), location_id.to_string()));
        match &self.creation_failure {
            Some((status, message)) => Err(OrchestratorError::api(*status, message.clone())),
            None => Ok(instance_with("vm-created", InstanceStatus::Creating, None, &[])),
        }
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Instance> {
        self.status_reads.fetch_add(1, Ordering::SeqCst);
        if let Some(instance) = self.details.get(instance_id) {
            return Ok(instance.clone());
        }

        let mut responses = self.responses.lock().unwrap();
        let next = if responses.len() > 1 {
            responses.pop_front()
        } else {
            responses.front().cloned()
        };
        match next {
            Some(Ok(instance)) => Ok(instance),
            Some(Err((status, message))) => Err(OrchestratorError::api(status, message)),
            None => Err(OrchestratorError::api(404, format!("instance {} not found", instance_id))),
        }
    }

    async fn list_instances(&self) -> Result<Vec<Instance>> {
        Ok(self.instances.clone())
    }

    async fn delete_instance(&self, instance_id: &str) -> Result<()> {
        self.deleted.lock().unwrap().push(instance_id.to_string());
        match self.delete_failures.get(instance_id) {
            Some((status, message)) => Err(OrchestratorError::api(*status, message.clone())),
            None => Ok(()),
        }
    }

    fn list_includes_details(&self) -> bool {
        self.list_details
    }
}

/// One scripted remote execution
#[derive(Debug, Clone)]
pub enum ScriptedRun {
    /// Print lines, then end with `exit`
    Finish { lines: Vec<String>, exit: RemoteExit },
    /// Print lines, close output, never report an exit until killed
    Hang { lines: Vec<String> },
}

impl ScriptedRun {
    pub fn exit(lines: &[&str], code: i32) -> Self {
        Self::Finish {
            lines: lines.iter().map(|l| l.to_string()).collect(),
            exit: RemoteExit::Exited(code),
        }
    }

    pub fn disconnect(lines: &[&str]) -> Self {
        Self::Finish {
            lines: lines.iter().map(|l| l.to_string()).collect(),
            exit: RemoteExit::ConnectionLost,
        }
    }

    pub fn hang(lines: &[&str]) -> Self {
        Self::Hang {
            lines: lines.iter().map(|l| l.to_string()).collect(),
        }
    }
}

/// Scripted [`RemoteShell`]
#[derive(Default)]
pub struct ScriptedShell {
    probes: Mutex<VecDeque<bool>>,
    probe_times: Mutex<Vec<Instant>>,
    probe_stall: Option<Duration>,
    runs: Mutex<VecDeque<ScriptedRun>>,
    commands: Mutex<Vec<String>>,
    upload_failure: Option<String>,
    uploads: Mutex<Vec<(ConnectionEndpoint, String, usize)>>,
}

impl ScriptedShell {
    /// Every probe fails and every run exits 0 unless scripted otherwise
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_probe_results(mut self, results: impl IntoIterator<Item = bool>) -> Self {
        self.probes = Mutex::new(results.into_iter().collect());
        self
    }

    /// Every probe blocks this long before answering
    pub fn with_probe_stall(mut self, stall: Duration) -> Self {
        self.probe_stall = Some(stall);
        self
    }

    pub fn with_runs(mut self, runs: Vec<ScriptedRun>) -> Self {
        self.runs = Mutex::new(runs.into());
        self
    }

    pub fn fail_uploads(mut self, reason: &str) -> Self {
        self.upload_failure = Some(reason.to_string());
        self
    }

    pub fn probe_times(&self) -> Vec<Instant> {
        self.probe_times.lock().unwrap().clone()
    }

    pub fn probe_count(&self) -> usize {
        self.probe_times.lock().unwrap().len()
    }

    pub fn executions(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn uploads(&self) -> Vec<(ConnectionEndpoint, String, usize)> {
        self.uploads.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteShell for ScriptedShell {
    async fn upload(
        &self,
        endpoint: &ConnectionEndpoint,
        payload: &[u8],
        remote_path: &str,
    ) -> Result<()> {
        self.uploads
            .lock()
            .unwrap()
            .push((endpoint.clone(), remote_path.to_string(), payload.len()));
        match &self.upload_failure {
            Some(reason) => Err(OrchestratorError::remote(reason.clone())),
            None => Ok(()),
        }
    }

    async fn execute(&self, _endpoint: &ConnectionEndpoint, command: &str) -> Result<RemoteProcess> {
        self.commands.lock().unwrap().push(command.to_string());
        let run = self
            .runs
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| ScriptedRun::exit(&[], 0));

        let (process, handle) = RemoteProcess::channel(64);
        let ProcessHandle { lines, exit, kill } = handle;

        tokio::spawn(async move {
            match run {
                ScriptedRun::Finish { lines: output, exit: status } => {
                    for line in output {
                        let _ = lines.send(line).await;
                    }
                    drop(lines);
                    let _ = exit.send(status);
                }
                ScriptedRun::Hang { lines: output } => {
                    for line in output {
                        let _ = lines.send(line).await;
                    }
                    drop(lines);
                    let _ = kill.await;
                    drop(exit);
                }
            }
        });

        Ok(process)
    }

    async fn probe(&self, _endpoint: &ConnectionEndpoint, _timeout: Duration) -> Result<bool> {
        self.probe_times.lock().unwrap().push(Instant::now());
        if let Some(stall) = self.probe_stall {
            tokio::time::sleep(stall).await;
        }
        Ok(self.probes.lock().unwrap().pop_front().unwrap_or(false))
    }
}
