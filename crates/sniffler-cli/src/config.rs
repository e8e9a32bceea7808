//! CLI-flag parsing support: proxy specs and settings overlay ([AMBIENT] 3
//! "overridable via CLI flags").

use std::str::FromStr;

use chrono::Utc;
use sniffler_core::config::Settings;
use sniffler_core::model::{DbProtocol, ProxyConfig, ProxyKind};

use crate::cli::Cli;

/// A `--proxy` flag value, parsed into enough to build a [`ProxyConfig`].
#[derive(Debug, Clone)]
pub struct ProxySpec {
    pub kind: ProxyKind,
    pub port: u16,
    pub name: String,
    pub target_host: Option<String>,
    pub target_port: Option<u16>,
    pub protocol: Option<DbProtocol>,
}

impl FromStr for ProxySpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        let kind = match parts.first().copied() {
            Some("normal") => ProxyKind::Normal,
            Some("outgoing") => ProxyKind::Outgoing,
            Some("db") => ProxyKind::Db,
            _ => return Err(format!("unknown proxy kind in spec '{s}' (expected normal/outgoing/db)")),
        };

        let port: u16 = parts
            .get(1)
            .ok_or_else(|| format!("missing port in spec '{s}'"))?
            .parse()
            .map_err(|_| format!("invalid port in spec '{s}'"))?;

        let name = parts.get(2).filter(|n| !n.is_empty()).map(|n| n.to_string()).unwrap_or_else(|| format!("{kind}-{port}"));

        match kind {
            ProxyKind::Outgoing => Ok(Self {
                kind,
                port,
                name,
                target_host: None,
                target_port: None,
                protocol: None,
            }),
            ProxyKind::Normal | ProxyKind::Db => {
                let target_host = parts.get(3).filter(|h| !h.is_empty()).map(|h| h.to_string()).ok_or_else(|| format!("{kind} proxy spec '{s}' requires target_host"))?;
                let target_port: u16 = parts
                    .get(4)
                    .ok_or_else(|| format!("{kind} proxy spec '{s}' requires target_port"))?
                    .parse()
                    .map_err(|_| format!("invalid target_port in spec '{s}'"))?;
                let protocol = match (kind, parts.get(5).copied()) {
                    (ProxyKind::Db, Some("mysql")) => Some(DbProtocol::Mysql),
                    (ProxyKind::Db, Some("mongodb")) => Some(DbProtocol::Mongodb),
                    (ProxyKind::Db, Some("redis")) => Some(DbProtocol::Redis),
                    (ProxyKind::Db, Some("other")) => Some(DbProtocol::Other),
                    (ProxyKind::Db, Some("postgres") | None) => Some(DbProtocol::Postgres),
                    (ProxyKind::Db, Some(other)) => return Err(format!("unknown db protocol '{other}' in spec '{s}'")),
                    _ => None,
                };
                Ok(Self {
                    kind,
                    port,
                    name,
                    target_host: Some(target_host),
                    target_port: Some(target_port),
                    protocol,
                })
            }
        }
    }
}

impl ProxySpec {
    pub fn into_config(self) -> ProxyConfig {
        ProxyConfig {
            kind: self.kind,
            port: self.port,
            name: self.name,
            target_host: self.target_host,
            target_port: self.target_port,
            target_url: None,
            protocol: self.protocol,
            auto_start: true,
            disabled: false,
            running_at_last_shutdown: false,
            created_at: Utc::now(),
        }
    }
}

/// Overlay CLI flags onto persisted (or default) settings. Only flags the
/// user actually passed take effect; everything else keeps the persisted
/// value (§4.11 "loaded from the settings key ... overridable via CLI
/// flags").
pub fn apply_cli_overrides(cli: &Cli, settings: &mut Settings) {
    if cli.testing_mode {
        settings.testing_mode = true;
    }
    if cli.no_pattern_matching {
        settings.pattern_matching_enabled = false;
    }
    if cli.auto_save_as_mocks {
        settings.auto_save_as_mocks = true;
    }
    if cli.mock_outgoing {
        settings.mocking_enabled_for_outgoing = true;
    }
    if cli.mock_db {
        settings.mocking_enabled_for_db = true;
    }
    if cli.no_filter_health_checks {
        settings.filter_health_checks = false;
    }
    if cli.no_global_auto_start {
        settings.global_auto_start = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_normal_spec() {
        let spec: ProxySpec = "normal:8080:api:localhost:3000".parse().unwrap();
        assert_eq!(spec.port, 8080);
        assert_eq!(spec.target_port, Some(3000));
        assert!(matches!(spec.kind, ProxyKind::Normal));
    }

    #[test]
    fn parses_outgoing_spec_without_target() {
        let spec: ProxySpec = "outgoing:8888:out".parse().unwrap();
        assert_eq!(spec.target_host, None);
    }

    #[test]
    fn parses_db_spec_with_explicit_protocol() {
        let spec: ProxySpec = "db:5433:pg:localhost:5432:mysql".parse().unwrap();
        assert!(matches!(spec.protocol, Some(DbProtocol::Mysql)));
    }

    #[test]
    fn rejects_unknown_kind() {
        assert!("weird:80:x".parse::<ProxySpec>().is_err());
    }

    #[test]
    fn rejects_normal_spec_missing_target() {
        assert!("normal:80:x".parse::<ProxySpec>().is_err());
    }
}
