//! sonar-authgate - token validation, permission rules and service-account
//! routing for a SonarQube MCP proxy.

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use serde_json::json;
use tracing::{error, info};

use sonar_authgate::{
    AuthGateway, Collaborators,
    cli::{Cli, Command},
    config::Config,
    permissions::{PermissionService, UserContext},
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Some(Command::Authorize { token, tool, project }) => {
            run_authorize(&config, &token, &tool, project.as_deref()).await
        }
        Some(Command::Explain {
            groups,
            tool,
            project,
            user,
        }) => run_explain(&config, &user, groups, &tool, project.as_deref()),
        Some(Command::Check) | None => run_check(&config).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Build every component and print a health summary.
async fn run_check(config: &Config) -> anyhow::Result<ExitCode> {
    let gateway = AuthGateway::from_config(config, Collaborators::http(config))
        .context("Failed to build auth gateway")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        issuers = gateway.identity_providers().issuers().len(),
        accounts = gateway.service_accounts().account_ids().len(),
        "Configuration OK"
    );

    gateway.service_accounts().probe_all().await;
    gateway.identity_providers().probe_now().await;
    println!("{}", serde_json::to_string_pretty(&gateway.health())?);
    gateway.shutdown();
    Ok(ExitCode::SUCCESS)
}

/// Authenticate a token, then authorize one tool (and optionally a project).
async fn run_authorize(
    config: &Config,
    token: &str,
    tool: &str,
    project: Option<&str>,
) -> anyhow::Result<ExitCode> {
    let gateway = AuthGateway::from_config(config, Collaborators::http(config))
        .context("Failed to build auth gateway")?;

    let session = match gateway.authenticate(token).await {
        Ok(session) => session,
        Err(e) => {
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "authenticated": false,
                    "status": e.http_status(),
                    "error": e.to_string(),
                    "www_authenticate": e.challenge(),
                }))?
            );
            gateway.shutdown();
            return Ok(ExitCode::FAILURE);
        }
    };

    let tool_decision = gateway.authorize_tool(&session.session_id, tool)?;
    let project_decision = project
        .map(|key| gateway.authorize_project(&session.session_id, key))
        .transpose()?;
    let allowed = tool_decision.allowed && project_decision.as_ref().is_none_or(|d| d.allowed);

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "authenticated": true,
            "user": session.user,
            "service_account_id": session.service_account_id,
            "tool": tool_decision,
            "project": project_decision,
        }))?
    );

    gateway.logout(&session.session_id);
    gateway.shutdown();
    Ok(if allowed { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

/// Evaluate permission rules without a token.
fn run_explain(
    config: &Config,
    user: &str,
    groups: Vec<String>,
    tool: &str,
    project: Option<&str>,
) -> anyhow::Result<ExitCode> {
    let mut permissions = config.permissions.clone();
    permissions.enable_audit = false;
    let service = PermissionService::new(permissions, None).context("Invalid permission rules")?;

    let user = UserContext::synthetic(user, groups);
    let rule = service.applicable_rule(&user).cloned();
    let tool_decision = service.check_tool_access(&user, tool);
    let project_decision = project.map(|key| service.check_project_access(&user, key));

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "user": user,
            "rule": rule,
            "tool": tool_decision,
            "project": project_decision,
        }))?
    );
    Ok(ExitCode::SUCCESS)
}
