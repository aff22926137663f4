//! Abstract firewall commands.
//!
//! A [`Command`] is one firewall mutation or query as pure data: building a
//! command list never touches the host. Execution context (namespace entry,
//! wait flag, simulation) is applied later by the executor.

use std::fmt;

/// One firewall mutation or query: the binary to invoke and its argument
/// vector, plus a short tag identifying the rule's purpose in logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub program: String,
    pub args: Vec<String>,
    pub tag: String,
}

impl Command {
    pub fn new<P, T>(program: P, args: Vec<String>, tag: T) -> Self
    where
        P: Into<String>,
        T: Into<String>,
    {
        Self {
            program: program.into(),
            args,
            tag: tag.into(),
        }
    }

    /// Returns a copy with the lock-wait flag appended, instructing the
    /// mutation binary to block instead of failing while another process
    /// holds the xtables lock.
    pub fn with_wait_flag(&self) -> Self {
        let mut command = self.clone();
        command.args.push("-w".to_string());
        command
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.program, self.args.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_full_invocation() {
        let command = Command::new(
            "iptables",
            vec!["-t".to_string(), "nat".to_string(), "-N".to_string(), "CHAIN".to_string()],
            "create-chain",
        );
        assert_eq!(command.to_string(), "iptables -t nat -N CHAIN");
    }

    #[test]
    fn wait_flag_is_appended_last() {
        let command = Command::new("iptables", vec!["-t".to_string(), "nat".to_string()], "t");
        let waited = command.with_wait_flag();
        assert_eq!(waited.args.last().map(String::as_str), Some("-w"));
        // the original is untouched
        assert_eq!(command.args.len(), 2);
    }
}
