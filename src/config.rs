//! Hand-rolled `.conf`-style configuration parser.
//!
//! The configuration file format and parser are an external collaborator
//! the core specification explicitly puts out of scope (§1); this module
//! exists so the daemon can actually run standalone end to end. Format: a
//! block of global `key = value` lines followed by any number of
//! `[service-name]` sections, each itself a block of `key = value` lines.
//! `#` starts a comment; blank lines are ignored.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::service::{Endpoint, GlobalOptions, Ownership, RemotePeer, ServiceOptions};

pub struct ParsedConfig {
    pub global: GlobalOptions,
    pub services: Vec<ServiceOptions>,
}

pub fn parse_file(path: &std::path::Path) -> Result<ParsedConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_str(&text, &path.display().to_string())
}

pub fn parse_str(text: &str, source_name: &str) -> Result<ParsedConfig, ConfigError> {
    let mut global = GlobalOptions::default();
    let mut services: Vec<RawService> = Vec::new();
    let mut current: Option<RawService> = None;

    for (idx, raw_line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = strip_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }

        if let Some(name) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            if let Some(finished) = current.take() {
                services.push(finished);
            }
            current = Some(RawService::new(name.trim()));
            continue;
        }

        let (key, value) = split_kv(line, source_name, line_no)?;

        match &mut current {
            Some(service) => service.apply(&key, &value, source_name, line_no)?,
            None => apply_global(&mut global, &key, &value, source_name, line_no)?,
        }
    }
    if let Some(finished) = current.take() {
        services.push(finished);
    }

    let services = services
        .into_iter()
        .map(RawService::finish)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ParsedConfig { global, services })
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(i) => &line[..i],
        None => line,
    }
}

fn split_kv(line: &str, source: &str, line_no: usize) -> Result<(String, String), ConfigError> {
    let (k, v) = line.split_once('=').ok_or_else(|| ConfigError::Parse {
        path: source.to_string(),
        line: line_no,
        message: format!("expected `key = value`, got {:?}", line),
    })?;
    Ok((k.trim().to_lowercase(), v.trim().to_string()))
}

fn apply_global(
    global: &mut GlobalOptions,
    key: &str,
    value: &str,
    source: &str,
    line_no: usize,
) -> Result<(), ConfigError> {
    match key {
        "chroot" => global.chroot = Some(PathBuf::from(value)),
        "setuid" => global.setuid = Some(parse_u32(value, source, line_no)?),
        "setgid" => global.setgid = Some(parse_u32(value, source, line_no)?),
        "maxclients" => global.max_clients = parse_i64(value, source, line_no)?,
        "syslog" => global.syslog_facility = Some(value.to_string()),
        "output" => global.output_file = Some(PathBuf::from(value)),
        "pid" => global.pid_file = Some(PathBuf::from(value)),
        other => {
            return Err(ConfigError::Parse {
                path: source.to_string(),
                line: line_no,
                message: format!("unknown global option {:?}", other),
            })
        }
    }
    Ok(())
}

fn parse_u32(value: &str, source: &str, line_no: usize) -> Result<u32, ConfigError> {
    value.parse().map_err(|_| ConfigError::Parse {
        path: source.to_string(),
        line: line_no,
        message: format!("expected an integer, got {:?}", value),
    })
}

fn parse_i64(value: &str, source: &str, line_no: usize) -> Result<i64, ConfigError> {
    value.parse().map_err(|_| ConfigError::Parse {
        path: source.to_string(),
        line: line_no,
        message: format!("expected an integer, got {:?}", value),
    })
}

fn parse_endpoint(value: &str, source: &str, line_no: usize) -> Result<Endpoint, ConfigError> {
    if value.starts_with('/') {
        return Ok(Endpoint::Unix(PathBuf::from(value)));
    }
    value
        .parse::<SocketAddr>()
        .map(Endpoint::Tcp)
        .map_err(|_| ConfigError::Parse {
            path: source.to_string(),
            line: line_no,
            message: format!("expected `host:port` or an absolute path, got {:?}", value),
        })
}

struct RawService {
    name: String,
    local: Vec<Endpoint>,
    connect: Vec<Endpoint>,
    exec: Option<String>,
    execargs: Vec<String>,
    session_timeout: Duration,
    chown_uid: Option<u32>,
    chown_gid: Option<u32>,
    sni_slave: bool,
}

impl RawService {
    fn new(name: &str) -> RawService {
        RawService {
            name: name.to_string(),
            local: Vec::new(),
            connect: Vec::new(),
            exec: None,
            execargs: Vec::new(),
            session_timeout: Duration::from_secs(300),
            chown_uid: None,
            chown_gid: None,
            sni_slave: false,
        }
    }

    fn apply(
        &mut self,
        key: &str,
        value: &str,
        source: &str,
        line_no: usize,
    ) -> Result<(), ConfigError> {
        match key {
            "accept" => self.local.push(parse_endpoint(value, source, line_no)?),
            "connect" => self.connect.push(parse_endpoint(value, source, line_no)?),
            "exec" => self.exec = Some(value.to_string()),
            "execargs" => self.execargs = value.split_whitespace().map(String::from).collect(),
            "timeoutclose" => {
                self.session_timeout =
                    Duration::from_secs(parse_i64(value, source, line_no)?.max(0) as u64)
            }
            "chown_uid" => self.chown_uid = Some(parse_u32(value, source, line_no)?),
            "chown_gid" => self.chown_gid = Some(parse_u32(value, source, line_no)?),
            "sni" => self.sni_slave = value.eq_ignore_ascii_case("slave"),
            other => {
                return Err(ConfigError::Parse {
                    path: source.to_string(),
                    line: line_no,
                    message: format!("unknown service option {:?}", other),
                })
            }
        }
        Ok(())
    }

    fn finish(self) -> Result<ServiceOptions, ConfigError> {
        let remote = if self.sni_slave {
            RemotePeer::SniSlave
        } else if let Some(program) = self.exec {
            RemotePeer::Exec {
                program,
                args: self.execargs,
            }
        } else {
            RemotePeer::Addrs(self.connect)
        };

        if self.local.is_empty() && matches!(remote, RemotePeer::Addrs(ref a) if a.is_empty()) {
            return Err(ConfigError::EmptyService(self.name));
        }

        let ownership = match (self.chown_uid, self.chown_gid) {
            (None, None) => None,
            (uid, gid) => Some(Ownership {
                uid: uid.unwrap_or(0),
                gid: gid.unwrap_or(0),
            }),
        };

        Ok(ServiceOptions {
            name: self.name,
            local: self.local,
            remote,
            session_timeout: self.session_timeout,
            ownership,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_global_and_one_service() {
        let text = "
            chroot = /var/empty
            setuid = 200
            setgid = 200

            [https]
            accept = 127.0.0.1:8443
            connect = 127.0.0.1:80
            timeoutclose = 60
        ";
        let parsed = parse_str(text, "test").unwrap();
        assert_eq!(parsed.global.chroot, Some(PathBuf::from("/var/empty")));
        assert_eq!(parsed.global.setuid, Some(200));
        assert_eq!(parsed.services.len(), 1);
        let svc = &parsed.services[0];
        assert_eq!(svc.name, "https");
        assert_eq!(svc.local.len(), 1);
        assert_eq!(svc.session_timeout, Duration::from_secs(60));
    }

    #[test]
    fn exec_connect_service_has_no_local_endpoints() {
        let text = "
            [helper]
            exec = /usr/bin/helper
            execargs = --flag value
            connect = 127.0.0.1:9000
        ";
        let parsed = parse_str(text, "test").unwrap();
        let svc = &parsed.services[0];
        assert!(svc.local.is_empty());
        match &svc.remote {
            RemotePeer::Exec { program, args } => {
                assert_eq!(program, "/usr/bin/helper");
                assert_eq!(args, &["--flag", "value"]);
            }
            _ => panic!("expected Exec remote"),
        }
    }

    #[test]
    fn service_with_no_endpoints_and_no_remote_is_an_error() {
        let text = "[empty]\ntimeoutclose = 10\n";
        assert!(matches!(
            parse_str(text, "test"),
            Err(ConfigError::EmptyService(_))
        ));
    }

    #[test]
    fn unknown_key_is_a_parse_error() {
        let text = "bogus = 1\n";
        assert!(matches!(parse_str(text, "test"), Err(ConfigError::Parse { .. })));
    }
}
