use adapt_kernel::config::{EngineConfig, TraceConfig};
use adapt_kernel::logging::{self, LogFormat};
use adapt_kernel::manifest::ExtensionManifest;
use adapt_kernel::{demo, ContentDescriptor, RequestDescriptor};
use adapt_signal::BodyHandle;
use anyhow::{bail, Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use semver::Version;
use std::path::PathBuf;

fn request_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("path")
                .long("path")
                .default_value("/")
                .help("Request target, may include a query string"),
        )
        .arg(
            Arg::new("method")
                .long("method")
                .default_value("GET")
                .help("Request method"),
        )
        .arg(
            Arg::new("body")
                .long("body")
                .value_parser(value_parser!(PathBuf))
                .help("File used as the content body"),
        )
        .arg(
            Arg::new("metadata")
                .long("metadata")
                .help("Content metadata as a JSON object"),
        )
        .arg(
            Arg::new("content-type")
                .long("content-type")
                .default_value("text/html; charset=utf-8")
                .help("Media type of the content body"),
        )
        .arg(
            Arg::new("identity")
                .long("identity")
                .help("Authenticated identity"),
        )
}

fn cli() -> Command {
    Command::new("adapt-kernel")
        .version(adapt_kernel::VERSION)
        .about("Adapt extension execution engine")
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Engine configuration (TOML)"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .global(true)
                .default_value("pretty")
                .value_parser(value_parser!(LogFormat))
                .help("pretty or json"),
        )
        .subcommand_required(true)
        .subcommand(
            request_args(Command::new("run").about("Run one request through the demo extensions")).arg(
                Arg::new("trace")
                    .long("trace")
                    .action(ArgAction::SetTrue)
                    .help("Print the request trace as JSON"),
            ),
        )
        .subcommand(request_args(
            Command::new("dry-run").about("Run Observe and Propose only and print the proposals"),
        ))
        .subcommand(
            Command::new("check-manifest")
                .about("Validate an extension manifest against this engine")
                .arg(
                    Arg::new("manifest")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Manifest file (TOML)"),
                ),
        )
}

fn load_config(matches: &ArgMatches) -> Result<EngineConfig> {
    match matches.get_one::<PathBuf>("config") {
        Some(path) => EngineConfig::from_path(path).with_context(|| format!("loading {}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

fn build_request(args: &ArgMatches) -> Result<(RequestDescriptor, ContentDescriptor)> {
    let method = args.get_one::<String>("method").map_or("GET", String::as_str);
    let path = args.get_one::<String>("path").map_or("/", String::as_str);
    let mut request = RequestDescriptor::new(method, path);
    if let Some(identity) = args.get_one::<String>("identity") {
        request = request.with_identity(identity.clone());
    }

    let mut content = ContentDescriptor::new();
    if let Some(file) = args.get_one::<PathBuf>("body") {
        let text = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
        content = content.with_body(BodyHandle::from_chunks(std::iter::once(text)));
    }
    if let Some(raw) = args.get_one::<String>("metadata") {
        let metadata: serde_json::Value = serde_json::from_str(raw).context("parsing --metadata")?;
        if !metadata.is_object() {
            bail!("--metadata must be a JSON object");
        }
        content = content.with_metadata(metadata);
    }
    if let Some(content_type) = args.get_one::<String>("content-type") {
        content = content.with_content_type(content_type.clone());
    }
    Ok((request, content))
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();
    let format = matches.get_one::<LogFormat>("log-format").copied().unwrap_or_default();
    logging::init(format);

    match matches.subcommand() {
        Some(("run", args)) => {
            let config = load_config(&matches)?.with_trace(TraceConfig {
                expose_headers: true,
                ..TraceConfig::default()
            });
            let engine = demo::engine(config)?;
            let (request, content) = build_request(args)?;
            let outcome = engine.execute(request, content).await?;

            println!("{}", outcome.response.status);
            for (name, value) in &outcome.response.headers {
                println!("{name}: {value}");
            }
            println!();
            println!("{}", outcome.response.body_string()?);
            if args.get_flag("trace") {
                println!("{}", serde_json::to_string_pretty(&outcome.trace)?);
            }
        }
        Some(("dry-run", args)) => {
            let engine = demo::engine(load_config(&matches)?)?;
            let (request, content) = build_request(args)?;
            let report = engine.dry_run(request, content).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Some(("check-manifest", args)) => {
            let Some(path) = args.get_one::<PathBuf>("manifest") else {
                bail!("missing manifest path");
            };
            let config = load_config(&matches)?;
            let version: Version = config.engine_version()?;
            let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            let manifest = ExtensionManifest::from_toml_str(&text)?;
            let checked = manifest.validate(&version)?;
            println!("{} {} ({}) accepted by engine {version}", checked.id, checked.version, checked.kind);
            for capability in checked.capabilities.iter() {
                println!("  capability {capability}");
            }
            for function in &checked.namespace {
                println!("  host function {function}");
            }
        }
        _ => bail!("unknown command"),
    }
    Ok(())
}
