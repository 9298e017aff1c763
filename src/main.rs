use anyhow::Result;
use patchscout::cli;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let invocation = cli::parse_args(&args)?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if invocation.verbose {
            EnvFilter::new("patchscout=debug,info")
        } else {
            EnvFilter::new("patchscout=warn")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();

    cli::run(invocation)
}
