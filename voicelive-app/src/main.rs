//! voicelive entry point: resolves configuration (including the managed
//! `/config` service) and prints the session `configure` payload, or a
//! diagnostic report with `--doctor`.

use anyhow::{bail, Context, Result};
use tracing::{info, warn};
use url::Url;

use voicelive_app::config::{VoiceLiveConfig, API_KEY_ENV};
use voicelive_app::managed::{ManagedConfig, ManagedConfigClient};
use voicelive_app::search::AzureSearchBackend;
use voicelive_app::telemetry;
use voicelive_session::derive::{build_session_options, is_cascaded};
use voicelive_session::lifecycle::AGENT_REQUIRED_MESSAGE;
use voicelive_session::protocol::API_VERSION;
use voicelive_session::settings::SessionMode;
use voicelive_session::tools::ToolKind;

const DEFAULT_CONFIG_PATH: &str = "voicelive.toml";

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

enum AppCommand {
    Plan { config_path: String },
    Doctor { config_path: String },
}

#[derive(Debug, Default)]
struct DoctorReport {
    notes: Vec<String>,
    warnings: Vec<String>,
}

fn parse_command() -> AppCommand {
    parse_args(std::env::args().skip(1))
}

fn parse_args(mut args: impl Iterator<Item = String>) -> AppCommand {
    match args.next() {
        Some(flag) if flag == "--doctor" => AppCommand::Doctor {
            config_path: args
                .next()
                .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string()),
        },
        Some(config_path) => AppCommand::Plan { config_path },
        None => AppCommand::Plan {
            config_path: DEFAULT_CONFIG_PATH.to_string(),
        },
    }
}

// ── Managed config ──────────────────────────────────────────────────────────

fn apply_managed_config(
    config: &mut VoiceLiveConfig,
    managed: &ManagedConfig,
    report: &mut DoctorReport,
) {
    if let Some(endpoint) = non_empty(managed.endpoint.clone()) {
        report.notes.push(format!("managed.endpoint={}", endpoint));
        config.connection.endpoint = endpoint;
    }
    if let Some(token) = non_empty(managed.token.clone()) {
        report.notes.push("managed.token=<present>".to_string());
        config.connection.token = Some(token);
    }

    if !managed.pre_defined_scenarios.is_empty() {
        let names: Vec<&str> = managed
            .pre_defined_scenarios
            .keys()
            .map(String::as_str)
            .collect();
        report
            .notes
            .push(format!("managed.scenarios={}", names.join(",")));
    }
    if let Some(name) = non_empty(config.connection.scenario.clone()) {
        match managed.scenario(&name) {
            Some(scenario) => {
                scenario.apply(&mut config.session);
                report.notes.push(format!("scenario applied: {}", name));
            }
            None => report
                .warnings
                .push(format!("Scenario '{}' is not published by the managed config", name)),
        }
    }

    if let Some(directory) = &managed.agent {
        directory.apply(&mut config.mode);
        report.notes.push(format!(
            "managed.agent.project={} agents={}",
            directory.project_name,
            directory.agents.len()
        ));
    }
}

async fn resolve_managed_config(
    config: &mut VoiceLiveConfig,
    report: &mut DoctorReport,
) -> Result<()> {
    let Some(url) = non_empty(config.connection.managed_config_url.clone()) else {
        if config.connection.scenario.is_some() {
            report
                .warnings
                .push("connection.scenario is set but no managed_config_url is configured".to_string());
        }
        return Ok(());
    };

    let client = ManagedConfigClient::new(&url)?;
    match client.fetch().await {
        Ok(Some(managed)) => apply_managed_config(config, &managed, report),
        Ok(None) => report
            .notes
            .push(format!("managed config: none published at {}", client.url())),
        Err(e) => report
            .warnings
            .push(format!("managed config unavailable ({:#}); using local settings", e)),
    }
    Ok(())
}

// ── Validation ──────────────────────────────────────────────────────────────

fn tool_names(tools: &[ToolKind]) -> String {
    if tools.is_empty() {
        return "none".to_string();
    }
    tools
        .iter()
        .map(|tool| tool.name())
        .collect::<Vec<_>>()
        .join(",")
}

fn validate_config(config: &VoiceLiveConfig, strict: bool) -> Result<DoctorReport> {
    let mut report = DoctorReport::default();

    let mode_label = match &config.mode {
        SessionMode::Model => "model".to_string(),
        SessionMode::Agent {
            project_name,
            agent_id,
        } => format!(
            "agent project={} agent_id={}",
            project_name,
            agent_id.as_deref().unwrap_or("<unset>")
        ),
    };
    report.notes.push(format!("mode={}", mode_label));
    report.notes.push(format!(
        "session.model={} cascaded={}",
        config.session.model,
        is_cascaded(&config.mode, &config.session.model)
    ));
    report
        .notes
        .push(format!("session.tools={}", tool_names(&config.session.tools)));
    report.notes.push(format!(
        "session.turn_detection={:?} avatar.enabled={} proactive={}",
        config.session.turn_detection.mode, config.session.avatar.enabled, config.session.proactive
    ));

    let problem = |message: String, report: &mut DoctorReport| -> Result<()> {
        if strict {
            bail!(message);
        }
        report.warnings.push(format!("{} (doctor mode allows this)", message));
        Ok(())
    };

    let endpoint = config.connection.endpoint.trim();
    if endpoint.is_empty() {
        problem(
            "No endpoint configured. Set [connection].endpoint or managed_config_url.".to_string(),
            &mut report,
        )?;
    } else {
        Url::parse(endpoint).with_context(|| format!("Invalid endpoint '{}'", endpoint))?;
    }

    let has_token = non_empty(config.connection.token.clone()).is_some();
    if !has_token && config.effective_api_key().is_empty() {
        problem(
            format!(
                "No credential resolved. Set [connection].api_key, [connection].token or {}.",
                API_KEY_ENV
            ),
            &mut report,
        )?;
    }

    if let SessionMode::Agent { agent_id, .. } = &config.mode {
        if non_empty(agent_id.clone()).is_none() {
            problem(AGENT_REQUIRED_MESSAGE.to_string(), &mut report)?;
        }
    }

    if config.session.tools.contains(&ToolKind::Search) {
        if config.search.enabled {
            AzureSearchBackend::from_config(&config.search)
                .context("Invalid [search] configuration")?;
        } else {
            report.warnings.push(
                "search tool declared without an enabled [search] backend; calls will return an error output"
                    .to_string(),
            );
        }
    }

    Ok(report)
}

fn print_doctor_report(config_path: &str, config: &VoiceLiveConfig, report: &DoctorReport) {
    println!("voicelive doctor report for '{}'", config_path);
    println!("api_version: {}", API_VERSION);
    println!(
        "connection: endpoint={} managed_config={}",
        non_empty(Some(config.connection.endpoint.clone()))
            .unwrap_or_else(|| "<unset>".to_string()),
        config
            .connection
            .managed_config_url
            .clone()
            .unwrap_or_else(|| "<none>".to_string())
    );
    for note in &report.notes {
        println!("note: {}", note);
    }
    if report.warnings.is_empty() {
        println!("warnings: none");
    } else {
        for warning in &report.warnings {
            println!("warning: {}", warning);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let command = parse_command();
    let (config_path, doctor) = match &command {
        AppCommand::Plan { config_path } => (config_path, false),
        AppCommand::Doctor { config_path } => (config_path, true),
    };

    let mut config = VoiceLiveConfig::load(config_path)?;
    if !doctor {
        telemetry::init(&config.telemetry.log_filter).context("Failed to initialize logging")?;
    }

    let mut managed_report = DoctorReport::default();
    resolve_managed_config(&mut config, &mut managed_report).await?;
    let mut report = validate_config(&config, !doctor)?;
    report.notes.extend(managed_report.notes);
    report.warnings.extend(managed_report.warnings);

    if doctor {
        print_doctor_report(config_path, &config, &report);
        return Ok(());
    }

    info!("voicelive resolved config from '{}'", config_path);
    for note in &report.notes {
        info!(diagnostic = %note, "Configuration diagnostic");
    }
    for warning_note in &report.warnings {
        warn!(diagnostic = %warning_note, "Configuration warning");
    }

    let options = build_session_options(&config.session, &config.mode);
    let payload =
        serde_json::to_string_pretty(&options).context("Failed to encode session options")?;
    println!("{}", payload);
    Ok(())
}
