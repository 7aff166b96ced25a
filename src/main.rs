//! deployctl - 环境部署与迁移编排器
//!
//! Usage:
//! - Deploy an environment:   `deployctl deploy dev`
//! - Regenerate secrets:      `deployctl deploy dev --force-config`
//! - Roll back to snapshot:   `deployctl rollback dev`
//! - Inspect current state:   `deployctl status dev`
//! - Delete absorbed legacy:  `deployctl purge-legacy dev --yes`

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use deployctl::config::settings::{defaults, EnvironmentPaths, Settings};
use deployctl::domain::service::HealthStatus;
use deployctl::infra::docker::DockerCli;
use deployctl::services::context::OrchestrateContext;
use deployctl::services::deploy;
use deployctl::services::health::RuntimeProbe;

/// 已解析的命令行
struct Cli {
    command: Command,
    environment: String,
}

#[derive(Debug, PartialEq)]
enum Command {
    Deploy { force_config: bool },
    Rollback,
    Status,
    PurgeLegacy { yes: bool },
}

/// 命令行解析结果
enum ParseOutcome {
    /// 正常执行
    Run(Cli),
    /// 显式请求帮助（成功退出）
    Help,
    /// 用法错误
    Invalid,
}

/// 解析命令行参数
fn parse_args(args: &[String]) -> ParseOutcome {
    if args.len() < 2 {
        return ParseOutcome::Invalid;
    }

    let mut environment = None;
    let mut force_config = false;
    let mut yes = false;

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--force-config" => force_config = true,
            "--yes" => yes = true,
            "--help" | "-h" => return ParseOutcome::Help,
            other if !other.starts_with('-') && environment.is_none() => {
                environment = Some(other.to_string());
            }
            other => {
                eprintln!("Unknown argument: {}", other);
                return ParseOutcome::Invalid;
            }
        }
        i += 1;
    }

    let command = match args[1].as_str() {
        "deploy" => Command::Deploy { force_config },
        "rollback" => Command::Rollback,
        "status" => Command::Status,
        "purge-legacy" => Command::PurgeLegacy { yes },
        "--help" | "-h" => return ParseOutcome::Help,
        _ => return ParseOutcome::Invalid,
    };

    match environment {
        Some(environment) => ParseOutcome::Run(Cli {
            command,
            environment,
        }),
        None => ParseOutcome::Invalid,
    }
}

fn print_help() {
    println!("deployctl {} - 环境部署与迁移编排器", defaults::VERSION);
    println!();
    println!("USAGE:");
    println!("    deployctl <COMMAND> <ENVIRONMENT> [OPTIONS]");
    println!();
    println!("COMMANDS:");
    println!("    deploy          Converge the environment to a healthy deployment");
    println!("    rollback        Restore the most recent snapshot and restart");
    println!("    status          Classify state and report per-service health");
    println!("    purge-legacy    Delete legacy data already absorbed and verified");
    println!();
    println!("OPTIONS:");
    println!("    --force-config  deploy: regenerate generated secrets");
    println!("    --yes           purge-legacy: confirm deletion");
    println!("    -h, --help      Print help information");
    println!();
    println!("EXAMPLES:");
    println!("    deployctl deploy dev");
    println!("    deployctl deploy production --force-config");
    println!("    deployctl rollback staging");
}

fn build_context(environment: &str, cancel: CancellationToken) -> OrchestrateContext {
    let settings = Settings::from_env();
    let paths = EnvironmentPaths::new(&settings, environment);
    let runtime = Arc::new(DockerCli::new(
        settings.command_timeout,
        settings.start_timeout,
        cancel.clone(),
    ));
    let probe = Arc::new(RuntimeProbe::new(runtime.clone(), settings.command_timeout));
    OrchestrateContext {
        environment: environment.to_string(),
        settings,
        paths,
        cancel,
        runtime,
        probe,
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "deployctl=info".into()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let cli = match parse_args(&args) {
        ParseOutcome::Run(cli) => cli,
        ParseOutcome::Help => {
            print_help();
            std::process::exit(0);
        }
        ParseOutcome::Invalid => {
            print_help();
            std::process::exit(10);
        }
    };

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create runtime: {}", e);
            std::process::exit(10);
        }
    };

    let code = rt.block_on(run(cli));
    std::process::exit(code);
}

async fn run(cli: Cli) -> i32 {
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received, cancelling after current step");
                cancel.cancel();
            }
        });
    }

    let ctx = build_context(&cli.environment, cancel);

    let result = match cli.command {
        Command::Deploy { force_config } => deploy::deploy(&ctx, force_config).await.map(|state| {
            println!("{}: {}", ctx.environment, state);
        }),
        Command::Rollback => deploy::manual_rollback(&ctx).await.map(|()| {
            println!("{}: rolled back to latest snapshot", ctx.environment);
        }),
        Command::Status => match deploy::status(&ctx).await {
            Ok((state, reports)) => {
                println!("{}: {}", ctx.environment, state);
                for report in reports {
                    let marker = match report.status {
                        HealthStatus::Healthy => "ok",
                        HealthStatus::Starting => "starting",
                        HealthStatus::Unreachable => "unreachable",
                        HealthStatus::Unhealthy => "down",
                    };
                    println!("  {:<12} {}", report.name, marker);
                }
                // 零退出码只代表目标健康
                return if state.is_healthy() { 0 } else { 1 };
            }
            Err(e) => Err(e),
        },
        Command::PurgeLegacy { yes } => {
            if !yes {
                eprintln!("purge-legacy deletes legacy data permanently; pass --yes to confirm");
                return 10;
            }
            deploy::purge_legacy(&ctx).await.map(|removed| {
                if removed.is_empty() {
                    println!("{}: nothing to purge", ctx.environment);
                } else {
                    for path in removed {
                        println!("removed {}", path.display());
                    }
                }
            })
        }
    };

    match result {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "Command failed");
            e.exit_code()
        }
    }
}
