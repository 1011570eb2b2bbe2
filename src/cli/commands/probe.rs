//! Probe command - one permission check, for verifying remote connectivity.

use crate::authz::{AccessDecision, HttpPermissionClient, Identity, PermissionService};
use crate::cli::args::ProbeArgs;
use anyhow::Result;
use std::process::ExitCode;

pub async fn run_probe(args: ProbeArgs) -> Result<ExitCode> {
    let config = args.remote.load()?;
    let client = HttpPermissionClient::from_config(&config.remote)?;
    let identity = Identity::new(args.token, args.key)?;
    let decision = client.check(&identity, &args.resource).await;
    println!("{}", describe(&decision));
    Ok(if decision.is_allowed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn describe(decision: &AccessDecision) -> String {
    match decision {
        AccessDecision::Allowed => "allowed".to_string(),
        AccessDecision::Denied { status } => format!("denied (status {status})"),
        AccessDecision::Indeterminate { reason } => format!("unreachable ({reason})"),
    }
}
