use anyhow::Result;

use pubsub_latency::broker::MockBroker;
use pubsub_latency::config::{self, BenchConfig, Commands, LogFormat, MockBrokerConfig};
use pubsub_latency::runner::BenchmarkRunner;

// The Rust runtime ignores SIGPIPE at startup, so a peer closing its socket
// shows up as a write error on that connection instead of killing the process.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = config::load_args();

    // Logs go to stderr so stdout carries only latency lines and the report
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(args.log_level.to_lowercase()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true);

    match args.log_format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }

    let mut mock: Option<MockBroker> = None;
    let config = match args.command {
        Commands::Run { server, workload } => {
            let config = BenchConfig::from_args(&server, &workload);
            config.validate()?;
            config
        }
        Commands::Standalone {
            workload,
            error_rate,
        } => {
            let config = BenchConfig::from_workload(&workload);
            config.validate()?;

            let mock_config = MockBrokerConfig {
                port: 0,
                error_rate,
            };
            mock_config.validate()?;

            tracing::info!("Starting mock broker...");
            let broker = mock.insert(MockBroker::new(mock_config));
            let port = broker.start().await?;
            tracing::info!("✅ Mock broker listening on {}", broker.addr());
            config.with_local_port(port)
        }
    };

    let runner = BenchmarkRunner::new(config);
    print_startup_banner(runner.config());

    let report = runner.run().await?;

    if let Some(broker) = mock.as_mut() {
        broker.stop();
    }

    if args.json {
        println!("{}", report.to_json());
    } else {
        report.print_table();
    }

    if let Some(error) = &report.error {
        anyhow::bail!("Benchmark aborted: {}", error);
    }
    Ok(())
}

/// Print startup banner
fn print_startup_banner(config: &BenchConfig) {
    let banner = r#"
╔═══════════════════════════════════════════════════════════╗
║                                                           ║
║              📡 pubsub-latency                            ║
║                                                           ║
║  Publish/subscribe fan-out latency benchmark              ║
║                                                           ║
╚═══════════════════════════════════════════════════════════╝
"#;

    eprintln!("{}", banner);
    eprintln!("  Version:     {}", env!("CARGO_PKG_VERSION"));
    eprintln!("  Server:      {}", config.addr());
    eprintln!("  Channel:     {}", config.channel);
    eprintln!(
        "  Workload:    {} subscribers × {} publishers",
        config.subscribers, config.publishers
    );
    eprintln!(
        "  Iterations:  {}",
        config
            .iterations
            .map_or_else(|| "unlimited".to_string(), |n| n.to_string())
    );
    eprintln!();
}
