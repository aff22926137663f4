//! Picks the firewall backend variant and resolves the binaries to invoke.
//!
//! Hosts ship up to three interchangeable rule toolchains: the legacy
//! xtables one, the nft-backed one, and an unqualified default. Installing
//! rules through the wrong one leaves them invisible to the kernel path the
//! runtime actually consults, so `auto` mode inspects live state to decide.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use super::command::Command;
use super::executor::{self, CommandRunner};
use super::FirewallConfig;

/// Chains the container runtime maintains in the mangle table of whichever
/// backend it actively uses. Their presence is the most reliable signal.
const MARKER_CHAINS: [&str; 2] = ["KUBE-IPTABLES-HINT", "KUBE-KUBELET-CANARY"];

/// Probe reporting whether a named executable resolves on the search path.
pub type Probe = dyn Fn(&str) -> bool + Sync;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("\"{0}\" is not a valid firewall backend; expected one of: auto, nft, legacy, plain")]
pub struct InvalidBackendMode(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendMode {
    /// Inspect live firewall state and pick nft or legacy.
    Auto,
    Nft,
    Legacy,
    /// Use the unqualified binaries, whatever they are linked to.
    Plain,
}

impl FromStr for BackendMode {
    type Err = InvalidBackendMode;

    fn from_str(literal: &str) -> Result<Self, Self::Err> {
        match literal {
            "auto" => Ok(Self::Auto),
            "nft" => Ok(Self::Nft),
            "legacy" => Ok(Self::Legacy),
            "plain" => Ok(Self::Plain),
            other => Err(InvalidBackendMode(other.to_string())),
        }
    }
}

impl fmt::Display for BackendMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let literal = match self {
            Self::Auto => "auto",
            Self::Nft => "nft",
            Self::Legacy => "legacy",
            Self::Plain => "plain",
        };
        f.write_str(literal)
    }
}

impl BackendMode {
    fn variant(&self) -> Option<&'static str> {
        match self {
            Self::Nft => Some("nft"),
            Self::Legacy => Some("legacy"),
            Self::Auto | Self::Plain => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::V4 => "iptables",
            Self::V6 => "ip6tables",
        }
    }
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4 => f.write_str("IPv4"),
            Self::V6 => f.write_str("IPv6"),
        }
    }
}

/// Binaries resolved for one address family, plus the mode that chose them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBackend {
    pub mode: BackendMode,
    pub bin: String,
    pub save_bin: String,
}

/// Resolves the dump binary for a backend variant: the family-qualified name
/// first, then the generic one.
///
/// Panics when neither resolves. Continuing without a dump binary would make
/// the idempotency scan silently wrong, so this is process-fatal.
pub fn find_best_binary(prefix: &str, variant: Option<&str>, probe: &Probe) -> String {
    let mut candidates = Vec::new();
    if let Some(variant) = variant {
        candidates.push(format!("{prefix}-{variant}-save"));
    }
    candidates.push(format!("{prefix}-save"));
    for candidate in &candidates {
        if probe(candidate) {
            return candidate.clone();
        }
    }
    panic!("no usable firewall dump binary on the search path, tried {candidates:?}");
}

fn mutation_binary(save_bin: &str) -> String {
    save_bin.strip_suffix("-save").unwrap_or(save_bin).to_string()
}

fn has_marker_chain(dump: &str) -> bool {
    dump.lines()
        .any(|line| MARKER_CHAINS.iter().any(|marker| line.strip_prefix(':').is_some_and(|l| l.starts_with(marker))))
}

fn count_rules(dump: &str) -> usize {
    dump.lines().filter(|line| line.starts_with('-')).count()
}

/// Dumps through the given binary, treating any failure as an empty ruleset.
/// Detection is a heuristic; a backend whose dump fails has nothing to say.
async fn dump(
    config: &FirewallConfig,
    save_bin: &str,
    args: &[&str],
    tag: &str,
    runner: &dyn CommandRunner,
) -> String {
    let command = Command::new(save_bin, args.iter().map(|a| a.to_string()).collect(), tag);
    match executor::execute(config, &command, runner).await {
        Ok(output) => output,
        Err(error) => {
            tracing::debug!(%error, save_bin, "backend dump failed, treating as empty");
            String::new()
        }
    }
}

/// Three-tier auto-detection: runtime marker chains in the nft mangle table,
/// then in the legacy mangle table, then a whole-ruleset rule-count
/// comparison (legacy wins ties). The count fallback covers freshly booted
/// hosts where neither backend carries marker chains yet.
pub async fn detect_backend(
    config: &FirewallConfig,
    family: IpFamily,
    runner: &dyn CommandRunner,
    probe: &Probe,
) -> BackendMode {
    let prefix = family.prefix();
    let nft_save = find_best_binary(prefix, Some("nft"), probe);
    let nft_mangle = dump(config, &nft_save, &["-t", "mangle"], "detect-nft-mangle", runner).await;
    if has_marker_chain(&nft_mangle) {
        return BackendMode::Nft;
    }

    let legacy_save = find_best_binary(prefix, Some("legacy"), probe);
    let legacy_mangle =
        dump(config, &legacy_save, &["-t", "mangle"], "detect-legacy-mangle", runner).await;
    if has_marker_chain(&legacy_mangle) {
        return BackendMode::Legacy;
    }

    let nft_rules = count_rules(&dump(config, &nft_save, &[], "detect-nft-rules", runner).await);
    let legacy_rules =
        count_rules(&dump(config, &legacy_save, &[], "detect-legacy-rules", runner).await);
    tracing::debug!(nft_rules, legacy_rules, "no marker chains found, comparing rule counts");
    if legacy_rules >= nft_rules {
        BackendMode::Legacy
    } else {
        BackendMode::Nft
    }
}

/// Resolves the backend and its binaries for one family.
///
/// `auto` follows detection. An explicit mode is honored outright but still
/// compared against detection so operators see mismatches in the logs.
pub async fn select_backend(
    config: &FirewallConfig,
    requested: BackendMode,
    family: IpFamily,
    runner: &dyn CommandRunner,
    probe: &Probe,
) -> ResolvedBackend {
    let mode = match requested {
        BackendMode::Auto => {
            let detected = detect_backend(config, family, runner, probe).await;
            tracing::info!(%family, backend = %detected, "detected firewall backend");
            detected
        }
        BackendMode::Nft | BackendMode::Legacy | BackendMode::Plain => {
            let detected = detect_backend(config, family, runner, probe).await;
            if detected != requested {
                tracing::warn!(
                    %family,
                    requested = %requested,
                    detected = %detected,
                    "requested firewall backend differs from the detected one"
                );
            }
            requested
        }
    };
    let save_bin = find_best_binary(family.prefix(), mode.variant(), probe);
    ResolvedBackend {
        mode,
        bin: mutation_binary(&save_bin),
        save_bin,
    }
}

/// Best-effort substitution for minimal images missing the configured
/// binaries: adopt the first fully resolvable pair among nft, plain, legacy.
/// When nothing resolves the input is returned unchanged and the first real
/// invocation surfaces the error.
pub fn resolve_bin_fallback(
    bin: &str,
    save_bin: &str,
    family: IpFamily,
    probe: &Probe,
) -> (String, String) {
    if probe(bin) && probe(save_bin) {
        return (bin.to_string(), save_bin.to_string());
    }
    let prefix = family.prefix();
    for variant in [Some("nft"), None, Some("legacy")] {
        let candidate_bin = match variant {
            Some(variant) => format!("{prefix}-{variant}"),
            None => prefix.to_string(),
        };
        let candidate_save = format!("{candidate_bin}-save");
        if probe(&candidate_bin) && probe(&candidate_save) {
            tracing::warn!(
                configured_bin = bin,
                configured_save_bin = save_bin,
                fallback_bin = %candidate_bin,
                fallback_save_bin = %candidate_save,
                "configured firewall binaries not found, substituting"
            );
            return (candidate_bin, candidate_save);
        }
    }
    tracing::warn!(
        configured_bin = bin,
        configured_save_bin = save_bin,
        "configured firewall binaries not found and no fallback pair resolves"
    );
    (bin.to_string(), save_bin.to_string())
}

/// Production probe: looks for an executable file in each `PATH` entry.
pub fn binary_on_path(name: &str) -> bool {
    use std::os::unix::fs::PermissionsExt;

    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| {
        let candidate = dir.join(name);
        candidate
            .metadata()
            .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::super::mocks::MockRunner;
    use super::super::tests::test_config;
    use super::*;

    fn available(names: &[&str]) -> impl Fn(&str) -> bool + Sync + use<> {
        let names: HashSet<String> = names.iter().map(|n| n.to_string()).collect();
        move |name: &str| names.contains(name)
    }

    #[test]
    fn parses_backend_literals() -> anyhow::Result<()> {
        assert_eq!("auto".parse::<BackendMode>()?, BackendMode::Auto);
        assert_eq!("nft".parse::<BackendMode>()?, BackendMode::Nft);
        assert_eq!("legacy".parse::<BackendMode>()?, BackendMode::Legacy);
        assert_eq!("plain".parse::<BackendMode>()?, BackendMode::Plain);
        assert_eq!(
            "iptables".parse::<BackendMode>(),
            Err(InvalidBackendMode("iptables".to_string()))
        );
        Ok(())
    }

    #[test]
    fn prefers_the_family_qualified_dump_binary() {
        let probe = available(&["iptables-nft-save", "iptables-save"]);
        assert_eq!(find_best_binary("iptables", Some("nft"), &probe), "iptables-nft-save");
    }

    #[test]
    fn falls_back_to_the_generic_dump_binary() {
        let probe = available(&["iptables-save"]);
        assert_eq!(find_best_binary("iptables", Some("nft"), &probe), "iptables-save");
    }

    #[test]
    #[should_panic(expected = "no usable firewall dump binary")]
    fn panics_when_no_dump_binary_resolves() {
        let probe = available(&[]);
        find_best_binary("iptables", Some("nft"), &probe);
    }

    #[tokio::test]
    async fn marker_chain_in_nft_mangle_selects_nft() {
        let runner = MockRunner::new();
        runner.set_stdout("iptables-nft-save -t mangle", ":KUBE-IPTABLES-HINT - [0:0]\nCOMMIT\n");
        let probe = available(&["iptables-nft-save", "iptables-legacy-save"]);

        let mode = detect_backend(&test_config(), IpFamily::V4, &runner, &probe).await;
        assert_eq!(mode, BackendMode::Nft);
    }

    #[tokio::test]
    async fn marker_chain_in_legacy_mangle_selects_legacy() {
        let runner = MockRunner::new();
        runner.set_stdout(
            "iptables-legacy-save -t mangle",
            ":KUBE-KUBELET-CANARY - [0:0]\nCOMMIT\n",
        );
        let probe = available(&["iptables-nft-save", "iptables-legacy-save"]);

        let mode = detect_backend(&test_config(), IpFamily::V4, &runner, &probe).await;
        assert_eq!(mode, BackendMode::Legacy);
    }

    #[tokio::test]
    async fn equal_rule_counts_select_legacy() {
        let runner = MockRunner::new();
        let probe = available(&["iptables-nft-save", "iptables-legacy-save"]);

        let mode = detect_backend(&test_config(), IpFamily::V4, &runner, &probe).await;
        assert_eq!(mode, BackendMode::Legacy);
    }

    #[tokio::test]
    async fn higher_nft_rule_count_selects_nft() {
        let runner = MockRunner::new();
        runner.set_stdout(
            "iptables-nft-save",
            "-A KUBE-SERVICES -j RETURN\n-A FORWARD -j ACCEPT\n",
        );
        runner.set_stdout("iptables-legacy-save", "-A FORWARD -j ACCEPT\n");
        let probe = available(&["iptables-nft-save", "iptables-legacy-save"]);

        let mode = detect_backend(&test_config(), IpFamily::V4, &runner, &probe).await;
        assert_eq!(mode, BackendMode::Nft);
    }

    #[tokio::test]
    async fn auto_selection_resolves_the_detected_pair() {
        let runner = MockRunner::new();
        runner.set_stdout("iptables-nft-save -t mangle", ":KUBE-IPTABLES-HINT - [0:0]\n");
        let probe = available(&["iptables-nft-save", "iptables-legacy-save"]);

        let backend =
            select_backend(&test_config(), BackendMode::Auto, IpFamily::V4, &runner, &probe).await;
        assert_eq!(
            backend,
            ResolvedBackend {
                mode: BackendMode::Nft,
                bin: "iptables-nft".to_string(),
                save_bin: "iptables-nft-save".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn plain_mode_is_honored_but_detection_still_runs() {
        let runner = MockRunner::new();
        runner.set_stdout("ip6tables-save -t mangle", ":KUBE-IPTABLES-HINT - [0:0]\n");
        let probe = available(&["ip6tables-save"]);

        let backend =
            select_backend(&test_config(), BackendMode::Plain, IpFamily::V6, &runner, &probe).await;
        assert_eq!(backend.bin, "ip6tables");
        assert_eq!(backend.save_bin, "ip6tables-save");
        assert!(!runner.invocations().is_empty());
    }

    #[test]
    fn fallback_keeps_a_resolvable_pair() {
        let probe = available(&["iptables", "iptables-save"]);
        let pair = resolve_bin_fallback("iptables", "iptables-save", IpFamily::V4, &probe);
        assert_eq!(pair, ("iptables".to_string(), "iptables-save".to_string()));
    }

    #[test]
    fn fallback_prefers_the_nft_pair() {
        let probe = available(&["iptables-nft", "iptables-nft-save", "iptables-legacy", "iptables-legacy-save"]);
        let pair = resolve_bin_fallback("iptables", "iptables-save", IpFamily::V4, &probe);
        assert_eq!(pair, ("iptables-nft".to_string(), "iptables-nft-save".to_string()));
    }

    #[test]
    fn fallback_tries_the_plain_pair_next() {
        let probe = available(&["iptables", "iptables-save", "iptables-nft"]);
        let pair = resolve_bin_fallback("iptables-nft", "iptables-nft-save", IpFamily::V4, &probe);
        assert_eq!(pair, ("iptables".to_string(), "iptables-save".to_string()));
    }

    #[test]
    fn fallback_reaches_the_legacy_pair_for_v6() {
        let probe = available(&["ip6tables-legacy", "ip6tables-legacy-save"]);
        let pair = resolve_bin_fallback("ip6tables", "ip6tables-save", IpFamily::V6, &probe);
        assert_eq!(pair, ("ip6tables-legacy".to_string(), "ip6tables-legacy-save".to_string()));
    }

    #[test]
    fn fallback_leaves_configuration_unchanged_when_nothing_resolves() {
        let probe = available(&["ip6tables-nft"]);
        let pair = resolve_bin_fallback("ip6tables", "ip6tables-save", IpFamily::V6, &probe);
        assert_eq!(pair, ("ip6tables".to_string(), "ip6tables-save".to_string()));
    }
}
