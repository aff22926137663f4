use std::process;
use std::time::{SystemTime, UNIX_EPOCH};

use mesh_init_lib::firewall::backend::{self, IpFamily};
use mesh_init_lib::firewall::command::Command;
use mesh_init_lib::firewall::executor::{self, CommandRunner, ProcessRunner};
use mesh_init_lib::firewall::{self, FirewallConfig};

mod cli;

/// Configures redirection for one address family, end to end: validate the
/// policy, resolve the backend binaries, then install (or tear down) the
/// rule set.
async fn run_family(
    args: &cli::Cli,
    family: IpFamily,
    trace_id: u64,
    runner: &dyn CommandRunner,
) -> Result<(), exitcode::ExitCode> {
    let mut config = args.build_firewall_config(family, trace_id).map_err(|error| {
        tracing::error!(%error, %family, "invalid redirection policy");
        exitcode::USAGE
    })?;
    let requested = args.backend_mode().map_err(|error| {
        tracing::error!(%error, "invalid redirection policy");
        exitcode::USAGE
    })?;

    if args.has_explicit_binaries() {
        tracing::info!(
            bin = %config.bin_path,
            save_bin = %config.save_bin_path,
            "using explicitly configured firewall binaries"
        );
    } else {
        let resolved =
            backend::select_backend(&config, requested, family, runner, &backend::binary_on_path)
                .await;
        config.bin_path = resolved.bin;
        config.save_bin_path = resolved.save_bin;
    }
    // minimal images may lack the chosen pair entirely
    let (bin, save_bin) = backend::resolve_bin_fallback(
        &config.bin_path,
        &config.save_bin_path,
        family,
        &backend::binary_on_path,
    );
    config.bin_path = bin;
    config.save_bin_path = save_bin;

    let result = if args.cleanup {
        firewall::cleanup(&config, runner).await
    } else {
        set_close_wait_timeout(args, family, &config, runner).await?;
        firewall::configure(&config, runner).await
    };
    result.map_err(|error| {
        tracing::error!(%error, %family, "firewall configuration failed");
        exitcode::OSERR
    })
}

/// Long CLOSE_WAIT conntrack entries pile up when the proxy intercepts
/// half-closed connections; operators can shorten the timeout at install
/// time. Namespace-scoped, so it runs through the executor like everything
/// else.
async fn set_close_wait_timeout(
    args: &cli::Cli,
    family: IpFamily,
    config: &FirewallConfig,
    runner: &dyn CommandRunner,
) -> Result<(), exitcode::ExitCode> {
    if args.timeout_close_wait_secs == 0 || family != IpFamily::V4 {
        return Ok(());
    }
    let command = Command::new(
        "sysctl",
        vec![
            "-w".to_string(),
            format!(
                "net.netfilter.nf_conntrack_tcp_timeout_close_wait={}",
                args.timeout_close_wait_secs
            ),
        ],
        "set-close-wait-timeout",
    );
    executor::execute(config, &command, runner).await.map_err(|error| {
        tracing::error!(%error, "could not set conntrack close-wait timeout");
        exitcode::OSERR
    })?;
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = cli::parse();

    // install global collector configured based on RUST_LOG env var.
    tracing_subscriber::fmt::init();
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting {}",
        env!("CARGO_PKG_NAME")
    );

    // stamped into rule comments so runs can be told apart in dumps
    let trace_id = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default();
    let runner = ProcessRunner;

    if let Err(code) = run_family(&args, IpFamily::V4, trace_id, &runner).await {
        process::exit(code);
    }
    if args.ipv6 && run_family(&args, IpFamily::V6, trace_id, &runner).await.is_err() {
        // not all hosts support IPv6; partial dual-stack is acceptable
        tracing::warn!("continuing without IPv6 redirection");
    }
    process::exit(exitcode::OK);
}
