use clap::Parser;
use thiserror::Error;

use mesh_init_lib::firewall::backend::{BackendMode, InvalidBackendMode, IpFamily};
use mesh_init_lib::firewall::{FirewallConfig, RedirectMode};
use mesh_init_lib::ports;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    InvalidPort(#[from] ports::Error),
    #[error(transparent)]
    InvalidBackend(#[from] InvalidBackendMode),
    #[error("\"{subnet}\" is not a valid CIDR subnet: {source}")]
    InvalidSubnet {
        subnet: String,
        source: cidr::errors::NetworkParseError,
    },
}

/// Installs iptables NAT rules redirecting a pod's traffic through its
/// sidecar proxy
#[derive(Clone, Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// Port the proxy accepts redirected inbound traffic on
    #[arg(short = 'p', long, env = "MESH_INIT_INCOMING_PROXY_PORT")]
    pub incoming_proxy_port: i64,

    /// Port the proxy accepts redirected outbound traffic on
    #[arg(short = 'o', long, env = "MESH_INIT_OUTGOING_PROXY_PORT")]
    pub outgoing_proxy_port: i64,

    /// User id of the proxy process; its own traffic skips redirection
    #[arg(short = 'u', long, env = "MESH_INIT_PROXY_UID", default_value_t = -1)]
    pub proxy_uid: i64,

    /// Group id of the proxy process; its own traffic skips redirection
    #[arg(short = 'g', long, env = "MESH_INIT_PROXY_GID", default_value_t = -1)]
    pub proxy_gid: i64,

    /// Inbound ports to redirect to the proxy; empty redirects every port
    #[arg(short = 'r', long, value_delimiter = ',')]
    pub ports_to_redirect: Vec<String>,

    /// Inbound ports and ranges to exempt from redirection
    #[arg(long, value_delimiter = ',')]
    pub inbound_ports_to_ignore: Vec<String>,

    /// Outbound ports and ranges to exempt from redirection
    #[arg(long, value_delimiter = ',')]
    pub outbound_ports_to_ignore: Vec<String>,

    /// CIDR subnets whose inbound traffic is exempt from redirection
    #[arg(long, value_delimiter = ',')]
    pub subnets_to_ignore: Vec<String>,

    /// Log the compiled commands without applying them
    #[arg(long)]
    pub simulate: bool,

    /// Network namespace to operate on instead of the current one
    #[arg(long)]
    pub netns: Option<String>,

    /// Pass the xtables wait flag so concurrent runs block instead of failing
    #[arg(short = 'w', long)]
    pub use_wait_flag: bool,

    /// Firewall backend to use: auto, nft, legacy or plain
    #[arg(long, env = "MESH_INIT_FIREWALL_BACKEND", default_value = "auto")]
    pub firewall_backend: String,

    /// Also configure IPv6 redirection; its failure is non-fatal
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub ipv6: bool,

    /// Conntrack close-wait timeout to set, in seconds; 0 leaves it alone
    #[arg(long, default_value_t = 0)]
    pub timeout_close_wait_secs: u64,

    /// Remove previously installed redirection state instead of installing
    #[arg(long)]
    pub cleanup: bool,

    /// Explicit rule-mutation binary, bypassing backend detection
    #[arg(long, hide = true)]
    pub firewall_bin_path: Option<String>,

    /// Explicit rule-dump binary, bypassing backend detection
    #[arg(long, hide = true)]
    pub firewall_save_bin_path: Option<String>,

    /// Drop FIN packets to and from the proxy (integration test hook)
    #[arg(long, hide = true)]
    pub drop_fin_for_testing: bool,
}

pub fn parse() -> Cli {
    Cli::parse()
}

impl Cli {
    pub fn backend_mode(&self) -> Result<BackendMode, Error> {
        Ok(self.firewall_backend.parse()?)
    }

    /// An explicit binary override disables backend detection.
    pub fn has_explicit_binaries(&self) -> bool {
        self.firewall_bin_path.is_some() || self.firewall_save_bin_path.is_some()
    }

    /// Validates the policy-level flags and assembles the per-family
    /// configuration. Fails before any firewall command is built.
    pub fn build_firewall_config(&self, family: IpFamily, trace_id: u64) -> Result<FirewallConfig, Error> {
        let incoming_proxy_port = validate_proxy_port(self.incoming_proxy_port)?;
        let outgoing_proxy_port = validate_proxy_port(self.outgoing_proxy_port)?;

        let mut redirect_ports = Vec::with_capacity(self.ports_to_redirect.len());
        for token in &self.ports_to_redirect {
            redirect_ports.push(ports::parse_port(token)?);
        }
        let redirect_mode = if redirect_ports.is_empty() {
            RedirectMode::All
        } else {
            RedirectMode::Listed(redirect_ports)
        };

        let mut subnets_to_ignore = Vec::with_capacity(self.subnets_to_ignore.len());
        for subnet in &self.subnets_to_ignore {
            let subnet = subnet.trim();
            if subnet.is_empty() {
                continue;
            }
            subnet
                .parse::<cidr::AnyIpCidr>()
                .map_err(|source| Error::InvalidSubnet {
                    subnet: subnet.to_string(),
                    source,
                })?;
            subnets_to_ignore.push(subnet.to_string());
        }

        let prefix = family.prefix();
        let bin_path = self
            .firewall_bin_path
            .clone()
            .unwrap_or_else(|| prefix.to_string());
        let save_bin_path = self
            .firewall_save_bin_path
            .clone()
            .unwrap_or_else(|| format!("{prefix}-save"));

        Ok(FirewallConfig {
            redirect_mode,
            incoming_proxy_port,
            outgoing_proxy_port,
            proxy_uid: owner_id(self.proxy_uid),
            proxy_gid: owner_id(self.proxy_gid),
            inbound_ports_to_ignore: self.inbound_ports_to_ignore.clone(),
            outbound_ports_to_ignore: self.outbound_ports_to_ignore.clone(),
            subnets_to_ignore,
            net_ns: self.netns.clone(),
            simulate_only: self.simulate,
            use_wait_flag: self.use_wait_flag,
            // teardown tolerates rules that are already absent
            continue_on_error: self.cleanup,
            drop_fin_for_testing: self.drop_fin_for_testing,
            bin_path,
            save_bin_path,
            trace_id,
        })
    }
}

fn validate_proxy_port(port: i64) -> Result<u16, Error> {
    if !ports::is_valid(port) {
        return Err(ports::Error::InvalidPort(port.to_string()).into());
    }
    Ok(port as u16)
}

// 0 is root, never the proxy's dedicated user; only positive ids opt in
fn owner_id(id: i64) -> Option<u32> {
    (id > 0).then_some(id as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Vec<&'static str> {
        vec!["mesh-init", "-p", "4143", "-o", "4140"]
    }

    fn parse_base() -> anyhow::Result<Cli> {
        Ok(Cli::try_parse_from(base_args())?)
    }

    #[test]
    fn parses_cli_with_minimum_arguments() -> anyhow::Result<()> {
        let args = parse_base()?;
        assert_eq!(args.incoming_proxy_port, 4143);
        assert_eq!(args.outgoing_proxy_port, 4140);
        assert_eq!(args.firewall_backend, "auto");
        assert!(args.ipv6);
        assert!(!args.cleanup);
        Ok(())
    }

    #[test]
    fn cli_parse_fails_when_proxy_ports_missing() {
        assert!(Cli::try_parse_from(["mesh-init"]).is_err());
        assert!(Cli::try_parse_from(["mesh-init", "-p", "4143"]).is_err());
    }

    #[test]
    fn builds_redirect_all_config_by_default() -> anyhow::Result<()> {
        let config = parse_base()?.build_firewall_config(IpFamily::V4, 1)?;
        assert_eq!(config.redirect_mode, RedirectMode::All);
        assert_eq!(config.incoming_proxy_port, 4143);
        assert!(config.proxy_uid.is_none());
        assert_eq!(config.bin_path, "iptables");
        assert_eq!(config.save_bin_path, "iptables-save");
        Ok(())
    }

    #[test]
    fn listed_redirect_ports_keep_their_order() -> anyhow::Result<()> {
        let mut args = base_args();
        args.extend(["-r", "80,443"]);
        let config = Cli::try_parse_from(args)?.build_firewall_config(IpFamily::V4, 1)?;
        assert_eq!(config.redirect_mode, RedirectMode::Listed(vec![80, 443]));
        Ok(())
    }

    #[test]
    fn rejects_out_of_domain_proxy_port() -> anyhow::Result<()> {
        let mut args = parse_base()?;
        args.incoming_proxy_port = 65536;
        assert!(args.build_firewall_config(IpFamily::V4, 1).is_err());
        Ok(())
    }

    #[test]
    fn subnets_are_trimmed_then_validated() -> anyhow::Result<()> {
        let mut args = parse_base()?;
        args.subnets_to_ignore = vec![" 10.0.0.0/8 ".to_string(), "fd00::/8".to_string()];
        let config = args.build_firewall_config(IpFamily::V4, 1)?;
        assert_eq!(config.subnets_to_ignore, vec!["10.0.0.0/8", "fd00::/8"]);

        args.subnets_to_ignore = vec!["10.0.0.0/golf".to_string()];
        assert!(args.build_firewall_config(IpFamily::V4, 1).is_err());
        Ok(())
    }

    #[test]
    fn non_positive_owner_ids_mean_unset() -> anyhow::Result<()> {
        let config = parse_base()?.build_firewall_config(IpFamily::V4, 1)?;
        assert!(config.proxy_uid.is_none());
        assert!(config.proxy_gid.is_none());

        let mut args = base_args();
        args.extend(["-u", "0", "-g", "0"]);
        let config = Cli::try_parse_from(args)?.build_firewall_config(IpFamily::V4, 1)?;
        assert!(config.proxy_uid.is_none());
        assert!(config.proxy_gid.is_none());

        let mut args = base_args();
        args.extend(["-u", "2102"]);
        let config = Cli::try_parse_from(args)?.build_firewall_config(IpFamily::V4, 1)?;
        assert_eq!(config.proxy_uid, Some(2102));
        Ok(())
    }

    #[test]
    fn unknown_backend_literal_is_rejected() -> anyhow::Result<()> {
        let mut args = base_args();
        args.extend(["--firewall-backend", "iptables"]);
        let cli = Cli::try_parse_from(args)?;
        assert!(cli.backend_mode().is_err());
        Ok(())
    }

    #[test]
    fn cleanup_runs_with_continue_on_error() -> anyhow::Result<()> {
        let mut args = base_args();
        args.push("--cleanup");
        let config = Cli::try_parse_from(args)?.build_firewall_config(IpFamily::V6, 1)?;
        assert!(config.continue_on_error);
        assert_eq!(config.bin_path, "ip6tables");
        Ok(())
    }

    #[test]
    fn explicit_binaries_bypass_detection() -> anyhow::Result<()> {
        let mut args = base_args();
        args.extend(["--firewall-bin-path", "/sbin/iptables-nft"]);
        let cli = Cli::try_parse_from(args)?;
        assert!(cli.has_explicit_binaries());
        let config = cli.build_firewall_config(IpFamily::V4, 1)?;
        assert_eq!(config.bin_path, "/sbin/iptables-nft");
        Ok(())
    }
}
