//! Compiles a redirection policy into an ordered list of firewall commands
//! and applies them.
//!
//! Two chains in the `nat` table are owned by this tool:
//! [`REDIRECT_CHAIN`] receives inbound traffic via a jump from `PREROUTING`,
//! [`OUTPUT_CHAIN`] receives outbound traffic via a jump from `OUTPUT`.
//! Re-running against an already-configured endpoint flushes the chain bodies
//! and leaves the jumps untouched, so repeated runs are safe.

pub mod backend;
pub mod command;
pub mod executor;
pub mod mocks;

use std::process::ExitStatus;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use crate::ports;

use command::Command;
use executor::CommandRunner;

pub const NAT_TABLE: &str = "nat";
pub const FILTER_TABLE: &str = "filter";

/// Kernel built-in chains this tool installs jumps into.
pub const PREROUTING_CHAIN: &str = "PREROUTING";
pub const OUTPUT_BUILTIN_CHAIN: &str = "OUTPUT";
pub const INPUT_BUILTIN_CHAIN: &str = "INPUT";

/// Chain holding the inbound redirection rules.
pub const REDIRECT_CHAIN: &str = "MESH_INIT_REDIRECT";
/// Chain holding the outbound redirection rules.
pub const OUTPUT_CHAIN: &str = "MESH_INIT_OUTPUT";

/// The multiport match extension accepts at most 15 port references per
/// rule; a bare port counts one, a range counts two.
pub const MULTIPORT_LIMIT: usize = 15;

/// Prefix namespacing every rule comment written by this tool.
pub const COMMENT_PREFIX: &str = "mesh-init";

const PREROUTING_JUMP_PATTERN: &str = r"(?m)^-A PREROUTING (.+ )?-j MESH_INIT_REDIRECT";
const OUTPUT_JUMP_PATTERN: &str = r"(?m)^-A OUTPUT (.+ )?-j MESH_INIT_OUTPUT";
const REDIRECT_CHAIN_PATTERN: &str = r"(?m)^:MESH_INIT_REDIRECT ";
const OUTPUT_CHAIN_PATTERN: &str = r"(?m)^:MESH_INIT_OUTPUT ";

static PREROUTING_JUMP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(PREROUTING_JUMP_PATTERN).expect("hard-coded pattern"));
static OUTPUT_JUMP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(OUTPUT_JUMP_PATTERN).expect("hard-coded pattern"));
static REDIRECT_CHAIN_EXISTS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(REDIRECT_CHAIN_PATTERN).expect("hard-coded pattern"));
static OUTPUT_CHAIN_EXISTS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(OUTPUT_CHAIN_PATTERN).expect("hard-coded pattern"));

#[derive(Debug, Error)]
pub enum Error {
    #[error("could not launch [{command}]: {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("[{command}] exited with {status}: {output}")]
    CommandFailed {
        command: String,
        status: ExitStatus,
        output: String,
    },
}

/// Which inbound ports get sent to the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirectMode {
    /// Redirect every inbound TCP port.
    All,
    /// Redirect only the listed ports, in the given order.
    Listed(Vec<u16>),
}

/// Fully resolved redirection policy plus execution context for one address
/// family. Immutable for the duration of a run.
#[derive(Debug, Clone)]
pub struct FirewallConfig {
    pub redirect_mode: RedirectMode,
    pub incoming_proxy_port: u16,
    pub outgoing_proxy_port: u16,
    pub proxy_uid: Option<u32>,
    pub proxy_gid: Option<u32>,
    pub inbound_ports_to_ignore: Vec<String>,
    pub outbound_ports_to_ignore: Vec<String>,
    pub subnets_to_ignore: Vec<String>,
    /// Target network namespace; `None` runs in the caller's namespace.
    pub net_ns: Option<String>,
    pub simulate_only: bool,
    pub use_wait_flag: bool,
    pub continue_on_error: bool,
    pub drop_fin_for_testing: bool,
    /// Rule-mutation binary, e.g. `iptables-nft`.
    pub bin_path: String,
    /// Rule-dump binary, e.g. `iptables-nft-save`.
    pub save_bin_path: String,
    /// Stamped into every rule comment so rules from distinct runs can be
    /// told apart in dumps.
    pub trace_id: u64,
}

/// What the idempotency scan found in the current table dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct InstalledState {
    redirect_chain: bool,
    output_chain: bool,
    prerouting_jump: bool,
    output_jump: bool,
}

fn scan_installed_state(dump: &str) -> InstalledState {
    InstalledState {
        redirect_chain: REDIRECT_CHAIN_EXISTS.is_match(dump),
        output_chain: OUTPUT_CHAIN_EXISTS.is_match(dump),
        prerouting_jump: PREROUTING_JUMP.is_match(dump),
        output_jump: OUTPUT_JUMP.is_match(dump),
    }
}

/// Packs port/range tokens into the fewest multiport destination groups,
/// greedily and in input order. Invalid tokens are logged and dropped
/// without consuming capacity.
pub fn multiport_destinations(ports_to_ignore: &[String]) -> Vec<Vec<String>> {
    if ports_to_ignore.is_empty() {
        return Vec::new();
    }
    let mut groups: Vec<Vec<String>> = Vec::new();
    let mut destinations: Vec<String> = Vec::new();
    let mut port_count = 0;
    for token in ports_to_ignore {
        let range = match ports::parse_port_range(token) {
            Ok(range) => range,
            Err(error) => {
                tracing::error!(token = %token, %error, "invalid port configuration, skipping");
                continue;
            }
        };
        let contribution = range.port_refs();
        if port_count + contribution > MULTIPORT_LIMIT {
            groups.push(std::mem::take(&mut destinations));
            port_count = 0;
        }
        port_count += contribution;
        destinations.push(range.to_string());
    }
    groups.push(destinations);
    groups
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|part| part.to_string()).collect()
}

impl FirewallConfig {
    fn format_comment(&self, tag: &str) -> String {
        format!("{COMMENT_PREFIX}/{tag}/{}", self.trace_id)
    }

    /// Appends one rule to a chain, stamped with this run's comment.
    fn append_rule(&self, table: &str, chain: &str, rule: &[&str], tag: &str) -> Command {
        let mut args = argv(&["-t", table, "-A", chain]);
        args.extend(argv(rule));
        args.extend(argv(&["-m", "comment", "--comment", &self.format_comment(tag)]));
        Command::new(&self.bin_path, args, tag)
    }

    fn chain_op(&self, op: &str, chain: &str, tag: &str) -> Command {
        Command::new(&self.bin_path, argv(&["-t", NAT_TABLE, op, chain]), tag)
    }

    fn dump_state(&self, tag: &str) -> Command {
        Command::new(&self.save_bin_path, argv(&["-t", NAT_TABLE]), tag)
    }

    /// Builds the jump into or out of a builtin chain. Jump comments carry
    /// no trace id: `-D` only deletes an exactly matching rule, and the
    /// installing run's trace id is unknown at teardown time.
    fn jump_command(&self, op: &str, builtin: &str, target: &str, comment_tag: &str, tag: &str) -> Command {
        let comment = format!("{COMMENT_PREFIX}/{comment_tag}");
        let mut args = argv(&["-t", NAT_TABLE, op, builtin, "-j", target]);
        args.extend(argv(&["-m", "comment", "--comment", &comment]));
        Command::new(&self.bin_path, args, tag)
    }

    /// Creating an existing chain is a hard failure, so chains found in the
    /// dump are flushed instead; stale bodies would apply outdated policy.
    fn ensure_chain(&self, commands: &mut Vec<Command>, chain: &str, exists: bool, tag: &str) {
        if exists {
            commands.push(self.chain_op("-F", chain, &format!("flush-{tag}")));
        } else {
            commands.push(self.chain_op("-N", chain, &format!("create-{tag}")));
        }
    }

    fn ignore_ports(&self, commands: &mut Vec<Command>, chain: &str, tokens: &[String]) {
        for destinations in multiport_destinations(tokens) {
            if destinations.is_empty() {
                continue;
            }
            let joined = destinations.join(",");
            commands.push(self.append_rule(
                NAT_TABLE,
                chain,
                &["-p", "tcp", "-m", "multiport", "--dports", &joined, "-j", "RETURN"],
                &format!("ignore-port-{joined}"),
            ));
        }
    }

    fn add_incoming_rules(&self, commands: &mut Vec<Command>, state: InstalledState) {
        self.ensure_chain(commands, REDIRECT_CHAIN, state.redirect_chain, "redirect-chain");
        self.ignore_ports(commands, REDIRECT_CHAIN, &self.inbound_ports_to_ignore);
        for subnet in &self.subnets_to_ignore {
            commands.push(self.append_rule(
                NAT_TABLE,
                REDIRECT_CHAIN,
                &["-p", "all", "-s", subnet, "-j", "RETURN"],
                &format!("ignore-subnet-{subnet}"),
            ));
        }
        let incoming = self.incoming_proxy_port.to_string();
        match &self.redirect_mode {
            RedirectMode::All => {
                commands.push(self.append_rule(
                    NAT_TABLE,
                    REDIRECT_CHAIN,
                    &["-p", "tcp", "-j", "REDIRECT", "--to-port", &incoming],
                    "redirect-all-incoming-to-proxy-port",
                ));
            }
            RedirectMode::Listed(ports) => {
                for port in ports {
                    let port = port.to_string();
                    commands.push(self.append_rule(
                        NAT_TABLE,
                        REDIRECT_CHAIN,
                        &[
                            "-p",
                            "tcp",
                            "--destination-port",
                            &port,
                            "-j",
                            "REDIRECT",
                            "--to-port",
                            &incoming,
                        ],
                        &format!("redirect-port-{port}-to-proxy-port"),
                    ));
                }
            }
        }
        if !state.prerouting_jump {
            commands.push(self.jump_command(
                "-A",
                PREROUTING_CHAIN,
                REDIRECT_CHAIN,
                "install-mesh-init-prerouting",
                "install-mesh-init-prerouting",
            ));
            if self.drop_fin_for_testing {
                commands.push(self.append_rule(
                    FILTER_TABLE,
                    INPUT_BUILTIN_CHAIN,
                    &["-p", "tcp", "--tcp-flags", "FIN", "FIN", "-j", "DROP"],
                    "drop-incoming-fin-for-testing",
                ));
            }
        }
    }

    fn add_outgoing_rules(&self, commands: &mut Vec<Command>, state: InstalledState) {
        self.ensure_chain(commands, OUTPUT_CHAIN, state.output_chain, "output-chain");
        if let Some(uid) = self.proxy_uid {
            let uid = uid.to_string();
            commands.push(self.append_rule(
                NAT_TABLE,
                OUTPUT_CHAIN,
                &["-m", "owner", "--uid-owner", &uid, "-j", "RETURN"],
                "ignore-proxy-user-id",
            ));
        }
        if let Some(gid) = self.proxy_gid {
            let gid = gid.to_string();
            commands.push(self.append_rule(
                NAT_TABLE,
                OUTPUT_CHAIN,
                &["-m", "owner", "--gid-owner", &gid, "-j", "RETURN"],
                "ignore-proxy-group-id",
            ));
        }
        commands.push(self.append_rule(
            NAT_TABLE,
            OUTPUT_CHAIN,
            &["-o", "lo", "-j", "RETURN"],
            "ignore-loopback",
        ));
        self.ignore_ports(commands, OUTPUT_CHAIN, &self.outbound_ports_to_ignore);
        let outgoing = self.outgoing_proxy_port.to_string();
        commands.push(self.append_rule(
            NAT_TABLE,
            OUTPUT_CHAIN,
            &["-p", "tcp", "-j", "REDIRECT", "--to-port", &outgoing],
            "redirect-all-outgoing-to-proxy-port",
        ));
        if !state.output_jump {
            commands.push(self.jump_command(
                "-A",
                OUTPUT_BUILTIN_CHAIN,
                OUTPUT_CHAIN,
                "install-mesh-init-output",
                "install-mesh-init-output",
            ));
            if self.drop_fin_for_testing {
                commands.push(self.append_rule(
                    FILTER_TABLE,
                    OUTPUT_BUILTIN_CHAIN,
                    &["-p", "tcp", "--tcp-flags", "FIN", "FIN", "-j", "DROP"],
                    "drop-outgoing-fin-for-testing",
                ));
            }
        }
    }

    /// Compiles the full install sequence against a snapshot of the current
    /// table state. Pure; never touches the host.
    pub fn configure_commands(&self, current_dump: &str) -> Vec<Command> {
        let state = scan_installed_state(current_dump);
        if state.prerouting_jump {
            tracing::info!("inbound redirection jump already installed, leaving it in place");
        }
        if state.output_jump {
            tracing::info!("outbound redirection jump already installed, leaving it in place");
        }
        let mut commands = Vec::new();
        self.add_incoming_rules(&mut commands, state);
        self.add_outgoing_rules(&mut commands, state);
        commands
    }

    /// Compiles the inverse sequence: remove both jumps, then flush and
    /// delete both chains. Meant to run with `continue_on_error` set, since
    /// any of these may already be absent.
    pub fn cleanup_commands(&self) -> Vec<Command> {
        vec![
            self.jump_command(
                "-D",
                PREROUTING_CHAIN,
                REDIRECT_CHAIN,
                "install-mesh-init-prerouting",
                "delete-prerouting-jump",
            ),
            self.jump_command(
                "-D",
                OUTPUT_BUILTIN_CHAIN,
                OUTPUT_CHAIN,
                "install-mesh-init-output",
                "delete-output-jump",
            ),
            self.chain_op("-F", OUTPUT_CHAIN, "flush-output-chain"),
            self.chain_op("-F", REDIRECT_CHAIN, "flush-redirect-chain"),
            self.chain_op("-X", OUTPUT_CHAIN, "delete-output-chain"),
            self.chain_op("-X", REDIRECT_CHAIN, "delete-redirect-chain"),
        ]
    }
}

/// Installs the redirection rules: dump current state, compile, apply,
/// then re-dump for diagnostics (best effort).
pub async fn configure(config: &FirewallConfig, runner: &dyn CommandRunner) -> Result<(), Error> {
    tracing::info!(trace_id = config.trace_id, "installing traffic redirection rules");
    let current = executor::execute(config, &config.dump_state("dump-existing-state"), runner).await?;
    let commands = config.configure_commands(&current);
    apply(config, &commands, runner).await?;
    log_final_state(config, runner).await;
    Ok(())
}

/// Removes previously installed redirection state.
pub async fn cleanup(config: &FirewallConfig, runner: &dyn CommandRunner) -> Result<(), Error> {
    tracing::info!(trace_id = config.trace_id, "removing traffic redirection rules");
    apply(config, &config.cleanup_commands(), runner).await?;
    log_final_state(config, runner).await;
    Ok(())
}

/// Applies mutation commands strictly in order. A failure aborts the rest of
/// the list unless `continue_on_error` is set, in which case it is logged
/// and skipped.
async fn apply(
    config: &FirewallConfig,
    commands: &[Command],
    runner: &dyn CommandRunner,
) -> Result<(), Error> {
    for command in commands {
        let command = if config.use_wait_flag {
            command.with_wait_flag()
        } else {
            command.clone()
        };
        if let Err(error) = executor::execute(config, &command, runner).await {
            if config.continue_on_error {
                tracing::warn!(%error, "continuing past failed command");
                continue;
            }
            return Err(error);
        }
    }
    Ok(())
}

async fn log_final_state(config: &FirewallConfig, runner: &dyn CommandRunner) {
    match executor::execute(config, &config.dump_state("dump-final-state"), runner).await {
        Ok(state) => tracing::info!("resulting nat table:\n{}", state.trim_end()),
        Err(error) => tracing::warn!(%error, "could not dump resulting nat table"),
    }
}
