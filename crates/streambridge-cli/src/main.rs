use std::process;
use std::sync::Arc;

use streambridge::transport::serve;
use streambridge::{
    AdapterConfig, CookieJar, ExternalPolicy, Interceptor, LocalProtocolLayer, PassThrough,
    ProtocolAdapter, RouterHandler, ServerConfig,
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

mod demo;

#[derive(Debug, Default, PartialEq)]
struct Args {
    server: ServerConfig,
    origin: Option<String>,
    reject_external: bool,
    debug: bool,
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let args = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: streambridge [--host <host>] [--port <port>] [--origin <url>] [--reject-external] [--debug]");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --host <host>        Address to listen on [default: 127.0.0.1]");
            eprintln!("  --port <port>        Port to listen on [default: 3000]");
            eprintln!("  --origin <url>       Origin served by the app [default: http://localhost:3000]");
            eprintln!("  --reject-external    Answer 502 for other origins instead of forwarding");
            eprintln!("  --debug              Log every adapted request");
            eprintln!();
            eprintln!("Environment:");
            eprintln!("  STREAMBRIDGE_LOG     debug|info|warn|error (RUST_LOG takes precedence)");
            eprintln!("  LOG_FORMAT=json      Emit JSON logs");
            process::exit(2);
        }
    };

    init_tracing();

    if let Err(e) = run(args).await {
        tracing::error!(error = %e, "streambridge failed");
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut parsed = Args::default();

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--host" => {
                i += 1;
                parsed.server.host = args.get(i).ok_or("--host requires a value")?.clone();
            }
            "--port" => {
                i += 1;
                let port = args.get(i).ok_or("--port requires a value")?;
                parsed.server.port = port
                    .parse()
                    .map_err(|_| format!("invalid port '{port}'"))?;
            }
            "--origin" => {
                i += 1;
                parsed.origin = Some(args.get(i).ok_or("--origin requires a value")?.clone());
            }
            "--reject-external" => parsed.reject_external = true,
            "--debug" => parsed.debug = true,
            "--help" | "-h" => return Err(String::new()),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }

    Ok(parsed)
}

/// `RUST_LOG` wins; otherwise `STREAMBRIDGE_LOG` sets the crate levels.
/// `LOG_FORMAT=json` switches to JSON on stderr.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("STREAMBRIDGE_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("trace") => "trace",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };

        EnvFilter::new(format!(
            "streambridge={level},streambridge_cli={level}",
            level = base_level
        ))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn adapter_config(args: &Args) -> anyhow::Result<AdapterConfig> {
    let mut config = AdapterConfig::from_env()?;
    if let Some(origin) = &args.origin {
        config.local_origin = origin.clone();
    }
    if args.reject_external {
        config.external = ExternalPolicy::Reject;
    }
    if args.debug {
        config.debug = true;
    }
    Ok(config)
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = adapter_config(&args)?;

    let adapter = Arc::new(
        ProtocolAdapter::new(
            Arc::new(RouterHandler::new(demo::app())),
            Arc::new(CookieJar::new()),
        )
        .with_config(&config),
    );

    // Schemes the interceptor does not own follow the same external policy.
    let mut layer = LocalProtocolLayer::new();
    if config.external == ExternalPolicy::PassThrough {
        layer = layer.with_fallback(Arc::new(PassThrough::new()?));
    }
    let layer = Arc::new(layer);

    let interceptor = Arc::new(Interceptor::from_config(layer.clone(), adapter, &config)?);
    interceptor.start()?;

    serve(args.server, layer, interceptor).await
}
