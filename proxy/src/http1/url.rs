use std::fmt::Display;

use crate::error::ProxyError;
use crate::http1::message::Method;

const SEARCH_DELIMS: &[char] = &[';', '?', '#'];

/// Request-target forms of RFC 7230 §5.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetForm {
    #[default]
    Origin,
    Absolute,
    Authority,
    Asterisk,
}

/// `[<user>[:<password>]@]<host>[:<port>]`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NetworkLocation {
    pub username: String,
    pub password: String,
    pub host: String,
    pub port: Option<u16>,
}

impl NetworkLocation {
    pub fn has_hostname(&self) -> bool {
        !self.host.is_empty()
    }

    pub fn has_port(&self) -> bool {
        self.port.is_some()
    }

    /// `host` or `host:port`, as written into a Host header.
    pub fn to_host_string(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.host, port),
            None => self.host.clone(),
        }
    }
}

impl Display for NetworkLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.username.is_empty() {
            f.write_str(&self.username)?;
            if !self.password.is_empty() {
                write!(f, ":{}", self.password)?;
            }
            f.write_str("@")?;
        }
        f.write_str(&self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        Ok(())
    }
}

/// Parsed request target. `search` keeps params, query, and fragment
/// concatenated exactly as received.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Url {
    pub form: TargetForm,
    pub scheme: String,
    pub netloc: NetworkLocation,
    pub path: String,
    pub search: String,
}

impl Url {
    pub fn make_authority_form(host: impl Into<String>, port: u16) -> Self {
        Url {
            form: TargetForm::Authority,
            netloc: NetworkLocation {
                host: host.into(),
                port: Some(port),
                ..NetworkLocation::default()
            },
            ..Url::default()
        }
    }

    pub fn make_origin_form(path: impl Into<String>, search: impl Into<String>) -> Self {
        Url {
            form: TargetForm::Origin,
            path: path.into(),
            search: search.into(),
            ..Url::default()
        }
    }

    /// Target parsing is method-sensitive: `CONNECT` forces authority form.
    pub fn parse_target(target: &str, method: Method) -> Result<Url, ProxyError> {
        if target.is_empty() {
            return Err(ProxyError::InvalidTargetHost);
        }
        if method == Method::Connect {
            return Self::parse_authority_form(target);
        }
        if target == "*" {
            return Ok(Url {
                form: TargetForm::Asterisk,
                ..Url::default()
            });
        }
        if target.starts_with('/') {
            return Ok(Self::parse_origin_form(target));
        }
        Self::parse_absolute_form(target)
    }

    /// Host and port are both required in authority form.
    pub fn parse_authority_form(target: &str) -> Result<Url, ProxyError> {
        let netloc = Self::parse_netloc(target)?;
        if !netloc.has_hostname() {
            return Err(ProxyError::InvalidTargetHost);
        }
        if !netloc.has_port() {
            return Err(ProxyError::InvalidTargetPort);
        }
        Ok(Url {
            form: TargetForm::Authority,
            netloc,
            ..Url::default()
        })
    }

    pub fn parse_origin_form(target: &str) -> Url {
        match target.find(SEARCH_DELIMS) {
            Some(delim) => Self::make_origin_form(&target[..delim], &target[delim..]),
            None => Self::make_origin_form(target, ""),
        }
    }

    /// `<scheme>://<netloc>/<path>;<params>?<query>#<fragment>` per RFC 1808.
    pub fn parse_absolute_form(target: &str) -> Result<Url, ProxyError> {
        let (scheme, rest) = match target.find("://") {
            Some(pos) => (&target[..pos], &target[pos + 3..]),
            None => ("", target.strip_prefix("//").unwrap_or(target)),
        };

        let netloc_end = rest
            .char_indices()
            .find(|(_, c)| *c == '/' || SEARCH_DELIMS.contains(c))
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        let netloc = Self::parse_netloc(&rest[..netloc_end])?;
        if !netloc.has_hostname() {
            return Err(ProxyError::InvalidTargetHost);
        }

        let tail = &rest[netloc_end..];
        let (path, search) = match tail.find(SEARCH_DELIMS) {
            Some(delim) => (&tail[..delim], &tail[delim..]),
            None => (tail, ""),
        };

        Ok(Url {
            form: TargetForm::Absolute,
            scheme: scheme.to_string(),
            netloc,
            path: path.to_string(),
            search: search.to_string(),
        })
    }

    /// Netloc of RFC 1738, without the trailing url-path. Bracketed IPv6
    /// hosts are supported; the brackets are stripped.
    pub fn parse_netloc(raw: &str) -> Result<NetworkLocation, ProxyError> {
        let raw = raw.strip_prefix("//").unwrap_or(raw);
        let mut netloc = NetworkLocation::default();

        let hostport = match raw.find('@') {
            Some(user_end) => {
                let userinfo = &raw[..user_end];
                match userinfo.find(':') {
                    Some(pass_start) => {
                        netloc.username = userinfo[..pass_start].to_string();
                        netloc.password = userinfo[pass_start + 1..].to_string();
                    }
                    None => netloc.username = userinfo.to_string(),
                }
                &raw[user_end + 1..]
            }
            None => raw,
        };

        if let Some(v6_end) = hostport.strip_prefix('[').and_then(|r| r.find(']')) {
            netloc.host = hostport[1..v6_end + 1].to_string();
            let rest = &hostport[v6_end + 2..];
            if let Some(port) = rest.strip_prefix(':') {
                netloc.port = Some(Self::parse_port(port)?);
            } else if !rest.is_empty() {
                return Err(ProxyError::InvalidTargetHost);
            }
        } else {
            match hostport.rfind(':') {
                Some(port_start) => {
                    netloc.host = hostport[..port_start].to_string();
                    netloc.port = Some(Self::parse_port(&hostport[port_start + 1..])?);
                }
                None => netloc.host = hostport.to_string(),
            }
        }

        Ok(netloc)
    }

    pub fn parse_port(raw: &str) -> Result<u16, ProxyError> {
        raw.parse::<u16>().map_err(|_| ProxyError::InvalidTargetPort)
    }

    /// The path component to send upstream in origin form.
    pub fn origin_string(&self) -> String {
        if self.path.is_empty() && self.search.is_empty() {
            "/".to_string()
        } else {
            format!("{}{}", self.path, self.search)
        }
    }

    pub fn host(&self) -> &str {
        &self.netloc.host
    }

    pub fn port_or(&self, default: u16) -> u16 {
        self.netloc.port.unwrap_or(default)
    }
}

impl Display for Url {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.form {
            TargetForm::Origin => write!(f, "{}", self.origin_string()),
            TargetForm::Authority => write!(f, "{}", self.netloc),
            TargetForm::Asterisk => f.write_str("*"),
            TargetForm::Absolute => {
                if !self.scheme.is_empty() {
                    write!(f, "{}://", self.scheme)?;
                }
                write!(f, "{}{}{}", self.netloc, self.path, self.search)
            }
        }
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_forces_authority_form() {
        let url = Url::parse_target("example.test:443", Method::Connect).unwrap();
        assert_eq!(url.form, TargetForm::Authority);
        assert_eq!(url.host(), "example.test");
        assert_eq!(url.netloc.port, Some(443));
    }

    #[test]
    fn authority_form_requires_port() {
        assert_eq!(
            Url::parse_target("example.test", Method::Connect).unwrap_err(),
            ProxyError::InvalidTargetPort
        );
    }

    #[test]
    fn origin_form_splits_path_and_search() {
        let url = Url::parse_target("/a/b?x=1#frag", Method::Get).unwrap();
        assert_eq!(url.form, TargetForm::Origin);
        assert_eq!(url.path, "/a/b");
        assert_eq!(url.search, "?x=1#frag");
        assert_eq!(url.origin_string(), "/a/b?x=1#frag");
    }

    #[test]
    fn absolute_form_full_round_trip() {
        let url = Url::parse_target("http://user:pw@example.test:8080/p;m?q=1", Method::Get)
            .unwrap();
        assert_eq!(url.form, TargetForm::Absolute);
        assert_eq!(url.scheme, "http");
        assert_eq!(url.netloc.username, "user");
        assert_eq!(url.netloc.password, "pw");
        assert_eq!(url.host(), "example.test");
        assert_eq!(url.netloc.port, Some(8080));
        assert_eq!(url.path, "/p");
        assert_eq!(url.search, ";m?q=1");
        assert_eq!(
            url.to_string(),
            "http://user:pw@example.test:8080/p;m?q=1"
        );
    }

    #[test]
    fn absolute_form_without_path() {
        let url = Url::parse_target("http://example.test", Method::Get).unwrap();
        assert_eq!(url.path, "");
        assert_eq!(url.origin_string(), "/");
    }

    #[test]
    fn asterisk_form() {
        let url = Url::parse_target("*", Method::Options).unwrap();
        assert_eq!(url.form, TargetForm::Asterisk);
        assert_eq!(url.to_string(), "*");
    }

    #[test]
    fn ipv6_netloc_with_port() {
        let netloc = Url::parse_netloc("[::1]:8443").unwrap();
        assert_eq!(netloc.host, "::1");
        assert_eq!(netloc.port, Some(8443));
    }

    #[test]
    fn bad_port_is_reported() {
        assert_eq!(
            Url::parse_netloc("example.test:notaport").unwrap_err(),
            ProxyError::InvalidTargetPort
        );
    }
}
