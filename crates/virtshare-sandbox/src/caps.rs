//! Capability whitelist.
//!
//! The server runs as root inside the namespaces but only needs the
//! file-serving slice of root: owning files, bypassing DAC, creating
//! device nodes. Everything else (networking, module loading, tracing) is
//! dropped. `-o modcaps=` fine-tunes the list per deployment.

use std::str::FromStr;

use tracing::debug;

/// Capabilities a file server acting as root needs.
///
/// CAP_LINUX_IMMUTABLE is left out (only reachable through ioctl, which is
/// not served); CAP_MAC_OVERRIDE is left out until an LSM user asks.
const WHITELIST: &[&str] = &[
    "CHOWN",
    "DAC_OVERRIDE",
    "DAC_READ_SEARCH",
    "FOWNER",
    "FSETID",
    "SETGID",
    "SETUID",
    "MKNOD",
    "SETFCAP",
];

/// One `+CAP` / `-CAP` entry from `-o modcaps=`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapAdjustment {
    pub add: bool,
    pub name: String,
}

impl FromStr for CapAdjustment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (sign, name) = s.split_at(s.len().min(1));
        let add = match sign {
            "+" => true,
            "-" => false,
            _ => return Err(format!("expected '+' or '-' prefix in modcaps entry {s:?}")),
        };
        if name.is_empty() {
            return Err("empty capability name in modcaps".to_string());
        }
        Ok(CapAdjustment {
            add,
            name: name.to_uppercase(),
        })
    }
}

/// Parse the colon-separated `modcaps` option value.
pub fn parse_modcaps(value: &str) -> Result<Vec<CapAdjustment>, String> {
    value.split(':').map(CapAdjustment::from_str).collect()
}

/// Replace the capability sets with the whitelist, adjusted by `modcaps`.
pub fn apply_whitelist(adjustments: &[CapAdjustment]) -> Result<(), String> {
    capng::get_caps_process().map_err(|e| e.to_string())?;
    capng::clear(capng::Set::BOTH);

    let mut updates = Vec::with_capacity(WHITELIST.len());
    for name in WHITELIST {
        let capability = capng::name_to_capability(name).map_err(|e| e.to_string())?;
        updates.push(capng::CUpdate {
            action: capng::Action::ADD,
            cap_type: capng::Type::PERMITTED | capng::Type::EFFECTIVE,
            capability,
        });
    }
    capng::update(updates).map_err(|e| e.to_string())?;

    for adjustment in adjustments {
        let capability = capng::name_to_capability(&adjustment.name)
            .map_err(|e| format!("unknown capability {:?}: {e}", adjustment.name))?;
        let action = if adjustment.add {
            capng::Action::ADD
        } else {
            capng::Action::DROP
        };
        debug!(cap = %adjustment.name, add = adjustment.add, "modcaps");
        capng::update(vec![capng::CUpdate {
            action,
            cap_type: capng::Type::PERMITTED | capng::Type::EFFECTIVE,
            capability,
        }])
        .map_err(|e| e.to_string())?;
    }

    capng::apply(capng::Set::BOTH).map_err(|e| e.to_string())
}

/// Drop every capability; used by the namespace supervisor whose only job
/// is waitpid.
pub fn drop_all() {
    capng::clear(capng::Set::BOTH);
    let _ = capng::apply(capng::Set::BOTH);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_modcaps() {
        let adjustments = parse_modcaps("+sys_admin:-mknod").unwrap();
        assert_eq!(
            adjustments,
            vec![
                CapAdjustment {
                    add: true,
                    name: "SYS_ADMIN".to_string()
                },
                CapAdjustment {
                    add: false,
                    name: "MKNOD".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_parse_modcaps_rejects_missing_sign() {
        assert!(parse_modcaps("sys_admin").is_err());
        assert!(parse_modcaps("+").is_err());
        assert!(parse_modcaps("").is_err());
    }
}
