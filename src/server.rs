// src/server.rs

use std::net::Ipv4Addr;
use tonic::transport::server::UdsConnectInfo;
use tonic::{Request, Response, Status};
use tracing::{info, warn};

use crate::error::ErrorKind;
use crate::orchestrator::{
    EditRequest, EnvironmentEntry, OperationFailure, OperationReport, Orchestrator,
};
use crate::sys::secrets::CredentialBundle;

pub mod devcenter_agent {
    tonic::include_proto!("devcenter.agent.v1");
}

use devcenter_agent::environment_agent_server::EnvironmentAgent;
use devcenter_agent::{
    CreateEnvironmentRequest, Credentials, EditEnvironmentRequest, EnvironmentResponse,
    ListEnvironmentsRequest, ListEnvironmentsResponse, Mismatch, RemoveEnvironmentRequest,
    RepairEnvironmentRequest, StepResult,
};

// ==============================================================================
// Response Mapping
// ==============================================================================

fn construct_error_response(username: &str, kind: ErrorKind, err_msg: &str) -> Result<Response<EnvironmentResponse>, Status> {
    Ok(Response::new(EnvironmentResponse {
        success: false,
        username: username.to_string(),
        error_kind: kind.as_str().to_string(),
        error_message: err_msg.to_string(),
        ..Default::default()
    }))
}

fn report_response(report: &OperationReport) -> EnvironmentResponse {
    EnvironmentResponse {
        success: true,
        username: report.username.clone(),
        state: report.state.to_string(),
        steps: report
            .steps
            .iter()
            .map(|s| StepResult {
                backend: s.backend.to_string(),
                action: s.action.clone(),
                outcome: s.outcome.as_str().to_string(),
                detail: s.detail.clone(),
            })
            .collect(),
        mismatches: report
            .mismatches
            .iter()
            .map(|m| Mismatch {
                backend: m.backend.to_string(),
                expected: m.expected.to_string(),
                observed: m.observed.to_string(),
            })
            .collect(),
        remediation: report.remediation.clone().unwrap_or_default(),
        ..Default::default()
    }
}

fn failure_response(failure: &OperationFailure) -> EnvironmentResponse {
    EnvironmentResponse {
        success: false,
        error_kind: failure.kind.as_str().to_string(),
        error_message: failure.message.clone(),
        ..report_response(&failure.report)
    }
}

/// 🛡️ The only place plaintext passwords leave their `Credential` wrapper:
/// straight into the one response that hands them to the operator.
fn credentials_message(bundle: &CredentialBundle) -> Credentials {
    Credentials {
        hostname: bundle.hostname.clone(),
        ssh_password: bundle.ssh_password.use_secret(str::to_string),
        db_password: bundle.db_password.use_secret(str::to_string),
    }
}

fn entry_message(entry: &EnvironmentEntry) -> devcenter_agent::EnvironmentEntry {
    let ip = |ip: Option<Ipv4Addr>| ip.map(|ip| ip.to_string()).unwrap_or_default();
    devcenter_agent::EnvironmentEntry {
        username: entry.username.clone(),
        classification: entry.classification.to_string(),
        state: entry.state.to_string(),
        dns_ip: ip(entry.dns_ip),
        database: if entry.database { "present" } else { "absent" }.to_string(),
        container_ip: ip(entry.container_ip),
        container_status: entry.container_status.as_str().to_string(),
    }
}

fn parse_ip(raw: &str) -> Option<Ipv4Addr> {
    raw.trim().parse().ok()
}

/// Root always passes; otherwise only the configured API uid.
fn uid_allowed(peer_uid: Option<u32>, expected_api_uid: u32) -> bool {
    matches!(peer_uid, Some(uid) if uid == 0 || uid == expected_api_uid)
}

// ==============================================================================
// Service
// ==============================================================================

pub struct DevCenterAgentService {
    orchestrator: Orchestrator,
    expected_api_uid: u32,
}

impl DevCenterAgentService {
    pub fn new(orchestrator: Orchestrator, expected_api_uid: u32) -> Self {
        Self { orchestrator, expected_api_uid }
    }

    /// 🛡️ Zero-Trust: the socket mode admits a group; SO_PEERCRED narrows it
    /// down to one uid.
    fn authorize<T>(&self, request: &Request<T>, rpc: &str) -> Result<(), Status> {
        let peer_uid = request
            .extensions()
            .get::<UdsConnectInfo>()
            .and_then(|info| info.peer_cred)
            .map(|cred| cred.uid());

        if uid_allowed(peer_uid, self.expected_api_uid) {
            Ok(())
        } else {
            warn!(rpc, ?peer_uid, "rejected caller");
            Err(Status::permission_denied("caller uid is not allowed to use this agent"))
        }
    }
}

#[tonic::async_trait]
impl EnvironmentAgent for DevCenterAgentService {
    async fn create_environment(
        &self,
        request: Request<CreateEnvironmentRequest>,
    ) -> Result<Response<EnvironmentResponse>, Status> {
        self.authorize(&request, "CreateEnvironment")?;
        let req = request.into_inner();
        info!(rpc = "CreateEnvironment", username = %req.username, ip = %req.ip, "request received");

        let Some(ip) = parse_ip(&req.ip) else {
            return construct_error_response(&req.username, ErrorKind::InvalidArgument, "ip must be an IPv4 address");
        };

        match self.orchestrator.create(&req.username, ip).await {
            Ok(provisioned) => Ok(Response::new(EnvironmentResponse {
                credentials: Some(credentials_message(&provisioned.credentials)),
                ..report_response(&provisioned.report)
            })),
            Err(failure) => Ok(Response::new(failure_response(&failure))),
        }
    }

    async fn edit_environment(
        &self,
        request: Request<EditEnvironmentRequest>,
    ) -> Result<Response<EnvironmentResponse>, Status> {
        self.authorize(&request, "EditEnvironment")?;
        let req = request.into_inner();
        info!(rpc = "EditEnvironment", username = %req.username, "request received");

        let new_ip = match req.new_ip.as_deref().filter(|raw| !raw.trim().is_empty()) {
            None => None,
            Some(raw) => match parse_ip(raw) {
                Some(ip) => Some(ip),
                None => {
                    return construct_error_response(&req.username, ErrorKind::InvalidArgument, "new_ip must be an IPv4 address");
                }
            },
        };
        let edit = EditRequest {
            new_username: req.new_username.filter(|name| !name.trim().is_empty()),
            new_ip,
        };

        match self.orchestrator.edit(&req.username, edit).await {
            Ok(outcome) => Ok(Response::new(EnvironmentResponse {
                credentials: outcome.credentials.as_ref().map(credentials_message),
                ..report_response(&outcome.report)
            })),
            Err(failure) => Ok(Response::new(failure_response(&failure))),
        }
    }

    async fn remove_environment(
        &self,
        request: Request<RemoveEnvironmentRequest>,
    ) -> Result<Response<EnvironmentResponse>, Status> {
        self.authorize(&request, "RemoveEnvironment")?;
        let req = request.into_inner();
        info!(rpc = "RemoveEnvironment", username = %req.username, "request received");

        match self.orchestrator.remove(&req.username).await {
            Ok(report) => Ok(Response::new(report_response(&report))),
            Err(failure) => Ok(Response::new(failure_response(&failure))),
        }
    }

    async fn repair_environment(
        &self,
        request: Request<RepairEnvironmentRequest>,
    ) -> Result<Response<EnvironmentResponse>, Status> {
        self.authorize(&request, "RepairEnvironment")?;
        let req = request.into_inner();
        info!(rpc = "RepairEnvironment", username = %req.username, "request received");

        match self.orchestrator.repair(&req.username).await {
            Ok(report) => Ok(Response::new(report_response(&report))),
            Err(failure) => Ok(Response::new(failure_response(&failure))),
        }
    }

    async fn list_environments(
        &self,
        request: Request<ListEnvironmentsRequest>,
    ) -> Result<Response<ListEnvironmentsResponse>, Status> {
        self.authorize(&request, "ListEnvironments")?;
        info!(rpc = "ListEnvironments", "request received");

        let report = self
            .orchestrator
            .list()
            .await
            .map_err(|e| Status::unavailable(e.to_string()))?;

        Ok(Response::new(ListEnvironmentsResponse {
            entries: report.entries.iter().map(entry_message).collect(),
            observed_at: report.observed_at.to_rfc3339(),
            dns_records: report.dns_records as u32,
            database_accounts: report.database_accounts as u32,
            containers: report.containers as u32,
        }))
    }
}
