#![forbid(unsafe_code)]

pub mod secret {
	use std::fmt;

	/// String that never shows up in logs.
	#[derive(Clone, PartialEq, Eq)]
	pub struct SecretString(String);

	impl SecretString {
		pub fn new(s: impl Into<String>) -> Self {
			Self(s.into())
		}

		/// Access the inner secret string.
		pub fn expose(&self) -> &str {
			&self.0
		}
	}

	impl fmt::Debug for SecretString {
		fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
			f.write_str("SecretString(<redacted>)")
		}
	}

	impl fmt::Display for SecretString {
		fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
			f.write_str("<redacted>")
		}
	}

	#[cfg(test)]
	mod tests {
		use super::*;

		#[test]
		fn formatting_redacts() {
			let s = SecretString::new("hunter2");
			assert_eq!(s.expose(), "hunter2");
			assert!(!format!("{s:?} {s}").contains("hunter2"));
		}
	}
}

pub mod endpoint {
	use std::net::SocketAddr;

	/// Parsed `ws://host:port[/path]` listen endpoint.
	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	pub struct WsEndpoint {
		pub host: String,
		pub port: u16,
		/// Upgrade path; `/` accepts any path.
		pub path: String,
	}

	impl WsEndpoint {
		/// Returns `host:port` (IPv6 stays bracketed).
		pub fn hostport(&self) -> String {
			format!("{}:{}", self.host, self.port)
		}

		/// Convert to `SocketAddr`; the host must be an IP literal.
		pub fn to_socket_addr(&self) -> Result<SocketAddr, String> {
			self.hostport()
				.parse()
				.map_err(|_| format!("bind host must be an IP literal: {}", self.host))
		}

		/// Whether a request path is served by this endpoint.
		pub fn accepts_path(&self, path: &str) -> bool {
			self.path == "/" || self.path == path
		}

		pub fn parse(s: &str) -> Result<Self, String> {
			let s = s.trim();
			if s.is_empty() {
				return Err("endpoint must be non-empty (expected ws://host:port)".to_string());
			}

			let rest = s
				.strip_prefix("ws://")
				.ok_or_else(|| format!("invalid endpoint (expected ws://host:port): {s}"))?;

			if rest.contains('?') || rest.contains('#') {
				return Err(format!("invalid endpoint (query/fragment not allowed): {s}"));
			}

			let (authority, path) = match rest.find('/') {
				Some(idx) => (&rest[..idx], &rest[idx..]),
				None => (rest, "/"),
			};

			let (host, port_str) = authority
				.rsplit_once(':')
				.ok_or_else(|| format!("invalid endpoint (missing :port): {s}"))?;

			let host = host.trim();
			if host.is_empty() {
				return Err(format!("invalid endpoint host: {s}"));
			}

			if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
				return Err(format!("IPv6 hosts must be bracketed like ws://[::1]:8080: {s}"));
			}

			let port = port_str
				.trim()
				.parse::<u16>()
				.ok()
				.filter(|p| *p != 0)
				.ok_or_else(|| format!("invalid endpoint port (expected 1..=65535): {s}"))?;

			let path = if path.len() > 1 { path.trim_end_matches('/') } else { path };

			Ok(Self {
				host: host.to_string(),
				port,
				path: path.to_string(),
			})
		}
	}

}
