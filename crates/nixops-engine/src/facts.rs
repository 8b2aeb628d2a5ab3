//! Hardware fact gathering, part of C4's reachability/discovery role (spec
//! §1 "discovers reachability of remote hosts and collects hardware facts";
//! §6 enumerates the fact keys, mirrored in `nixops_shared::HARDWARE_FACT_KEYS`).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use nixops_command::handler::NoopHandler;
use nixops_shared::HARDWARE_FACT_KEYS;
use openssh::Session;
use tokio_util::sync::CancellationToken;

use crate::errors::SshError;
use crate::ssh::SshTransport;

/// A single `sh -c` probe emitting `key=value` lines for every key in
/// `HARDWARE_FACT_KEYS`. Kept as one round trip rather than one command per
/// fact to keep remote round trips to a minimum over a possibly
/// high-latency link.
const PROBE_SCRIPT: &str = r#"
echo "os.name=$(. /etc/os-release 2>/dev/null; echo "${NAME:-unknown}")"
echo "os.id=$(. /etc/os-release 2>/dev/null; echo "${ID:-unknown}")"
echo "kernel.version=$(uname -r)"
echo "architecture=$(uname -m)"
echo "hostname=$(hostname)"
echo "uptime.days=$(awk '{print int($1/86400)}' /proc/uptime 2>/dev/null || echo 0)"
echo "cpu.model=$(awk -F': ' '/model name/ {print $2; exit}' /proc/cpuinfo 2>/dev/null || echo unknown)"
echo "cpu.cores=$(nproc 2>/dev/null || echo 0)"
echo "memory.mb=$(awk '/MemTotal/ {print int($2/1024)}' /proc/meminfo 2>/dev/null || echo 0)"
echo "virtualization.type=$(systemd-detect-virt 2>/dev/null || echo none)"
echo "container.engine=$(systemd-detect-virt --container 2>/dev/null || echo none)"
echo "system.serial=$(cat /sys/class/dmi/id/product_serial 2>/dev/null || echo unknown)"
echo "system.uuid=$(cat /sys/class/dmi/id/product_uuid 2>/dev/null || echo unknown)"
echo "system.timezone=$(readlink /etc/localtime 2>/dev/null | sed 's#.*/zoneinfo/##' || echo unknown)"
"#;

pub async fn gather(
    transport: &SshTransport,
    session: &Arc<Session>,
    timeout: Duration,
) -> Result<BTreeMap<String, String>, SshError> {
    let cancel = CancellationToken::new();
    let mut handler = NoopHandler;
    let (_, out) = transport
        .run_captured(
            session,
            "sh",
            &["-c".to_owned(), PROBE_SCRIPT.to_owned()],
            timeout,
            &cancel,
            &mut handler,
        )
        .await?;
    Ok(parse_facts(&String::from_utf8_lossy(&out)))
}

fn parse_facts(text: &str) -> BTreeMap<String, String> {
    let mut facts = BTreeMap::new();
    for line in text.lines() {
        if let Some((key, value)) = line.split_once('=') {
            if HARDWARE_FACT_KEYS.contains(&key) {
                facts.insert(key.to_owned(), value.to_owned());
            }
        }
    }
    facts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_facts_keeps_only_known_keys() {
        let text = "os.name=NixOS\nbogus.key=1\ncpu.cores=8\n";
        let facts = parse_facts(text);
        assert_eq!(facts.get("os.name").map(String::as_str), Some("NixOS"));
        assert_eq!(facts.get("cpu.cores").map(String::as_str), Some("8"));
        assert!(!facts.contains_key("bogus.key"));
    }

    #[test]
    fn parse_facts_tolerates_values_with_equals_signs() {
        let text = "system.timezone=Etc/UTC\ncpu.model=Intel(R) Xeon @ freq=2.4GHz\n";
        let facts = parse_facts(text);
        assert_eq!(
            facts.get("cpu.model").map(String::as_str),
            Some("Intel(R) Xeon @ freq=2.4GHz")
        );
    }
}
