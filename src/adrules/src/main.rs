//! AdRules — threshold rules that stop or flag VK Ads ads.
//!
//! Main entry point: loads configuration, wires the rule engine to the ad
//! platform, runs the pass scheduler and serves the REST API.

use adrules_api::ApiServer;
use adrules_core::clock::SystemClock;
use adrules_core::config::AppConfig;
use adrules_core::types::{
    ConditionOperator, RuleActions, RuleCondition, RuleDraft, RuleTargets, RuleType, Tier,
};
use adrules_engine::{
    Collaborators, InMemoryActionLog, LogNotifier, RateLimitRetry, RetryPolicy, RuleEngine,
    RuleRegistry, SimulatedPlatform, StaticTierLimits,
};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "adrules")]
#[command(about = "Threshold rules that stop or flag VK Ads ads")]
#[command(version)]
struct Cli {
    /// Node identifier (overrides config)
    #[arg(long, env = "ADRULES__NODE_ID")]
    node_id: Option<String>,

    /// HTTP port (overrides config)
    #[arg(long, env = "ADRULES__API__HTTP_PORT")]
    http_port: Option<u16>,

    /// Token required by `POST /v1/passes` (overrides config)
    #[arg(long, env = "ADRULES__API__OPERATOR_TOKEN", hide_env_values = true)]
    operator_token: Option<String>,

    /// Seconds between evaluation passes (overrides config)
    #[arg(long, env = "ADRULES__ENGINE__PASS_INTERVAL_SECS")]
    pass_interval_secs: Option<u64>,

    /// Optional TOML config file
    #[arg(long, short)]
    config: Option<String>,

    /// Owner of the seeded demo account and rules
    #[arg(long, default_value = "demo-user")]
    demo_user: String,

    /// Run a single pass, print the report as JSON and exit
    #[arg(long, default_value_t = false)]
    once: bool,

    /// Serve the API without the pass scheduler
    #[arg(long, default_value_t = false)]
    no_scheduler: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so `--once` leaves stdout for the report.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "adrules=info,adrules_engine=info,tower_http=info".into()),
        )
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();

    info!("AdRules starting up");

    let mut config = AppConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    // Apply CLI overrides
    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }
    if let Some(token) = cli.operator_token {
        config.api.operator_token = Some(token);
    }
    if let Some(secs) = cli.pass_interval_secs {
        config.engine.pass_interval_secs = secs.max(1);
    }

    info!(
        node_id = %config.node_id,
        http_port = config.api.http_port,
        operator_endpoints = config.api.operator_token.is_some(),
        pass_interval_secs = config.engine.pass_interval_secs,
        max_concurrent_evaluations = config.engine.max_concurrent_evaluations,
        "Configuration loaded"
    );

    let platform = Arc::new(SimulatedPlatform::new());
    platform.seed_demo(&cli.demo_user);
    let engine = build_engine(&config, platform.clone(), &cli.demo_user)?;

    if cli.once {
        let report = engine.run_pass().await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let api_server = ApiServer::new(config.clone(), engine.clone());

    if let Err(e) = api_server.start_metrics().await {
        error!(error = %e, "Failed to start metrics exporter");
    }

    if cli.no_scheduler {
        info!("Running in API-only mode (no pass scheduler)");
    } else {
        let interval = Duration::from_secs(config.engine.pass_interval_secs);
        tokio::spawn(run_scheduler(engine, platform, interval));
    }

    info!("AdRules is ready to serve traffic");

    // Start HTTP server (blocks until shutdown)
    api_server.start_http().await?;

    Ok(())
}

/// Wire the engine to the simulated platform and register the demo rules.
fn build_engine(
    config: &AppConfig,
    platform: Arc<SimulatedPlatform>,
    demo_user: &str,
) -> anyhow::Result<RuleEngine> {
    let platform = Arc::new(RateLimitRetry::new(platform, RetryPolicy::from(&config.retry)));

    let tiers = Arc::new(StaticTierLimits::new(config.tiers.clone()));
    tiers.assign(demo_user, Tier::Pro);
    let rules = Arc::new(RuleRegistry::new(tiers));

    for draft in demo_rules() {
        let rule = rules.create_rule(demo_user, draft)?;
        info!(rule_id = %rule.id, name = %rule.name, "Demo rule registered");
    }

    Ok(RuleEngine::new(
        config.engine.clone(),
        rules,
        Collaborators {
            inventory: platform.clone(),
            metrics: platform.clone(),
            controller: platform,
            notifier: Arc::new(LogNotifier),
            log: Arc::new(InMemoryActionLog::new()),
            clock: Arc::new(SystemClock),
        },
    ))
}

fn demo_rules() -> Vec<RuleDraft> {
    vec![
        RuleDraft {
            name: "Stop expensive leads".into(),
            rule_type: RuleType::CplLimit,
            condition: RuleCondition {
                operator: ConditionOperator::GreaterThan,
                value: 500.0,
            },
            actions: RuleActions {
                stop_ad: true,
                notify: true,
            },
            targets: RuleTargets {
                account_ids: ["demo-acc-1".to_string()].into(),
                ..Default::default()
            },
            is_active: true,
        },
        RuleDraft {
            name: "Weak CTR on reach".into(),
            rule_type: RuleType::MinCtr,
            condition: RuleCondition {
                operator: ConditionOperator::LessThan,
                value: 0.5,
            },
            actions: RuleActions {
                stop_ad: false,
                notify: true,
            },
            targets: RuleTargets {
                campaign_ids: ["demo-camp-reach".to_string()].into(),
                ..Default::default()
            },
            is_active: true,
        },
    ]
}

/// Advance simulated delivery by one interval, then run a pass. A failed pass
/// is logged and retried on the next tick.
async fn run_scheduler(engine: RuleEngine, platform: Arc<SimulatedPlatform>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let hours_per_tick = interval.as_secs_f64() / 3600.0;

    loop {
        ticker.tick().await;
        platform.advance_delivery(hours_per_tick);
        match engine.run_pass().await {
            Ok(report) => info!(
                pass_id = %report.pass_id,
                pairs = report.pairs_evaluated,
                triggered = report.triggered,
                acted = report.acted,
                failures = report.action_failures,
                "Scheduled pass finished"
            ),
            Err(e) => error!(error = %e, "Scheduled pass aborted"),
        }
    }
}
