use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use mk_catalog::{CatalogValidator, ChordCatalog};
use mk_kernel::k8s::{current_context, K8sPlan, PlanVerifier};
use mk_kernel::{
    render_report, run_eval, AgentConfig, ApplyContext, ClusterAccessor, JsonlFileSource, Kubectl, PlanTarget,
    WatchSession,
};
use mk_license::BindingContext;
use mk_policy::PolicyKind;
use mk_signals::ingest_reader;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    let config_arg = Arg::new("config")
        .long("config")
        .global(true)
        .value_parser(value_parser!(PathBuf))
        .help("TOML configuration file");
    let out_arg = Arg::new("out")
        .long("out")
        .value_parser(value_parser!(PathBuf))
        .help("Output directory for the trace and reports");
    let input_arg = Arg::new("input")
        .long("input")
        .required(true)
        .value_parser(value_parser!(PathBuf))
        .help("Telemetry JSON Lines file");
    let plan_arg = Arg::new("plan")
        .long("plan")
        .required(true)
        .value_parser(value_parser!(PathBuf))
        .help("K8s plan JSON file");

    Command::new("mk")
        .version(mk_kernel::VERSION)
        .about("ModeKeeper verify-first control agent")
        .subcommand_required(true)
        .arg(config_arg)
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON on stderr"),
        )
        .subcommand(
            Command::new("eval")
                .about("Evaluate recorded telemetry offline, without cluster access")
                .arg(input_arg.clone())
                .arg(
                    Arg::new("window")
                        .long("window")
                        .default_value("32")
                        .value_parser(value_parser!(usize))
                        .help("Samples per window"),
                )
                .arg(
                    Arg::new("stride")
                        .long("stride")
                        .value_parser(value_parser!(usize))
                        .help("Samples between window starts (defaults to the window size)"),
                )
                .arg(
                    Arg::new("policy")
                        .long("policy")
                        .value_parser(["chord", "scalar"])
                        .help("Policy variant"),
                )
                .arg(out_arg.clone()),
        )
        .subcommand(
            Command::new("watch")
                .about("Run the closed loop on a fixed interval")
                .arg(input_arg)
                .arg(
                    Arg::new("interval-ms")
                        .long("interval-ms")
                        .value_parser(value_parser!(u64))
                        .help("Milliseconds between ticks"),
                )
                .arg(
                    Arg::new("max-ticks")
                        .long("max-ticks")
                        .value_parser(value_parser!(u64))
                        .help("Stop after this many ticks"),
                )
                .arg(
                    Arg::new("apply")
                        .long("apply")
                        .action(ArgAction::SetTrue)
                        .help("Verify and apply allowed actions"),
                )
                .arg(
                    Arg::new("approve-advanced")
                        .long("approve-advanced")
                        .action(ArgAction::SetTrue)
                        .help("Allow advanced-tier chords"),
                )
                .arg(out_arg.clone()),
        )
        .subcommand(
            Command::new("chords").subcommand_required(true).subcommand(
                Command::new("validate")
                    .about("Validate a chord catalog")
                    .arg(
                        Arg::new("catalog")
                            .long("catalog")
                            .value_parser(value_parser!(PathBuf))
                            .help("Catalog JSON (defaults to the builtin catalog)"),
                    ),
            ),
        )
        .subcommand(
            Command::new("license").subcommand_required(true).subcommand(
                Command::new("verify")
                    .about("Verify a license document")
                    .arg(
                        Arg::new("license")
                            .long("license")
                            .value_parser(value_parser!(PathBuf))
                            .help("License document"),
                    )
                    .arg(
                        Arg::new("keys")
                            .long("keys")
                            .value_parser(value_parser!(PathBuf))
                            .help("Public key allowlist"),
                    ),
            ),
        )
        .subcommand(
            Command::new("k8s")
                .subcommand_required(true)
                .subcommand(
                    Command::new("verify")
                        .about("Check a plan against the cluster without mutating it")
                        .arg(plan_arg.clone())
                        .arg(out_arg.clone()),
                )
                .subcommand(
                    Command::new("apply")
                        .about("Apply a plan through the kill switch, license and verify gates")
                        .arg(plan_arg)
                        .arg(out_arg),
                ),
        )
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

fn load_config(matches: &ArgMatches) -> anyhow::Result<AgentConfig> {
    let path = matches.get_one::<PathBuf>("config");
    let mut config = AgentConfig::load(path.map(PathBuf::as_path))?;
    if let Some(out) = matches.try_get_one::<PathBuf>("out").ok().flatten() {
        config.out_dir = Some(out.clone());
    }
    Ok(config)
}

/// Print a deterministic report on stdout.
fn emit<T: serde::Serialize + ?Sized>(report: &T) -> anyhow::Result<()> {
    print!("{}", render_report(report)?);
    Ok(())
}

fn exit_status(ok: bool) -> ExitCode {
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn read_plan(path: &Path) -> anyhow::Result<K8sPlan> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(K8sPlan::parse(&text)?)
}

async fn run(matches: ArgMatches) -> anyhow::Result<ExitCode> {
    match matches.subcommand() {
        Some(("eval", args)) => {
            let mut config = load_config(args)?;
            if let Some(policy) = args.get_one::<String>("policy") {
                config.policy.kind = policy.parse::<PolicyKind>()?;
            }
            config.validate()?;
            let window = args.get_one::<usize>("window").copied().unwrap_or(32);
            let stride = args.get_one::<usize>("stride").copied().unwrap_or(window);

            let input = args
                .get_one::<PathBuf>("input")
                .context("--input is required")?;
            let file = File::open(input).with_context(|| format!("opening {}", input.display()))?;
            let ingested = ingest_reader(BufReader::new(file));
            let summary = run_eval(&config, &ingested, window, stride)?;
            emit(&summary)?;
            Ok(ExitCode::SUCCESS)
        }
        Some(("watch", args)) => {
            let mut config = load_config(args)?;
            if let Some(&interval_ms) = args.get_one::<u64>("interval-ms") {
                config.watch.interval_ms = interval_ms;
            }
            if let Some(&max_ticks) = args.get_one::<u64>("max-ticks") {
                config.watch.max_ticks = Some(max_ticks);
            }
            if args.get_flag("apply") {
                config.watch.apply = true;
            }
            if args.get_flag("approve-advanced") {
                config.gate.approve_advanced = true;
            }
            config.validate()?;

            let input = args
                .get_one::<PathBuf>("input")
                .context("--input is required")?;
            let mut session = WatchSession::new(config.clone(), Box::new(JsonlFileSource::new(input)))?;
            if config.watch.apply {
                session = session.with_apply(ApplyContext::connect(&config).await?);
            }
            let summary = session.run().await?;
            emit(&summary)?;
            Ok(ExitCode::SUCCESS)
        }
        Some(("chords", sub)) => match sub.subcommand() {
            Some(("validate", args)) => {
                let report = match args.get_one::<PathBuf>("catalog") {
                    Some(path) => {
                        let text =
                            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
                        CatalogValidator::new().validate_str(&text, &path.display().to_string())
                    }
                    None => CatalogValidator::new().validate_str(ChordCatalog::builtin_v1_text(), "builtin"),
                };
                emit(&report)?;
                Ok(exit_status(report.ok))
            }
            _ => Ok(ExitCode::FAILURE),
        },
        Some(("license", sub)) => match sub.subcommand() {
            Some(("verify", args)) => {
                let mut config = load_config(args)?;
                if let Some(path) = args.get_one::<PathBuf>("license") {
                    config.license = config.license.with_license_path(path);
                }
                if let Some(path) = args.get_one::<PathBuf>("keys") {
                    config.license = config.license.with_public_keys_path(path);
                }
                let kubectl = Kubectl::new(&config.cluster);
                let binding = match config.cluster.context.clone() {
                    Some(context) => Some(context),
                    None => current_context(&kubectl).await,
                }
                .map_or_else(BindingContext::default, |c| BindingContext::default().with_kube_context(c));
                let context = ApplyContext::new(
                    Arc::new(kubectl),
                    config.license.build_verifier()?,
                    config.license.clone(),
                    PlanTarget::new(&config.cluster.namespace, &config.cluster.deployment),
                )
                .with_binding(binding);
                let verification = context.verify_license();
                emit(&verification)?;
                Ok(exit_status(verification.ok))
            }
            _ => Ok(ExitCode::FAILURE),
        },
        Some(("k8s", sub)) => match sub.subcommand() {
            Some(("verify", args)) => {
                let config = load_config(args)?;
                let plan = read_plan(args.get_one::<PathBuf>("plan").context("--plan is required")?)?;
                let kubectl = Kubectl::new(&config.cluster);
                let accessor: &dyn ClusterAccessor = &kubectl;
                let report = PlanVerifier::new(accessor).verify(&plan).await;
                if args.get_one::<PathBuf>("out").is_some() {
                    mk_kernel::write_report(&config.out_dir().join("k8s_verify.json"), &report)?;
                }
                emit(&report)?;
                Ok(exit_status(report.ok))
            }
            Some(("apply", args)) => {
                let config = load_config(args)?;
                let plan = read_plan(args.get_one::<PathBuf>("plan").context("--plan is required")?)?;
                let context = ApplyContext::connect(&config).await?;
                let allowed = plan.len();
                let outcome = context.execute_plan(plan, allowed).await;
                if args.get_one::<PathBuf>("out").is_some() {
                    mk_kernel::write_report(&config.out_dir().join("k8s_apply.json"), &outcome)?;
                }
                emit(&outcome)?;
                Ok(exit_status(
                    outcome.decision.block_reason.is_none() && outcome.decision.apply_ok != Some(false),
                ))
            }
            _ => Ok(ExitCode::FAILURE),
        },
        _ => Ok(ExitCode::FAILURE),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let matches = cli().get_matches();
    init_tracing(matches.get_flag("log-json"));
    info!(version = mk_kernel::VERSION, "mk starting");

    match run(matches).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("ERROR: {err:#}");
            ExitCode::from(2)
        }
    }
}
