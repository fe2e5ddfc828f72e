//! Derivation of the one-time login code an [`Account`](crate::config::Account)
//! presents during [`UpstreamTransport::log_in`](crate::session::UpstreamTransport::log_in).
//!
//! A short (≤5 char) secret is already the static code. A longer secret is a
//! base64-encoded shared secret from which a 30-second time-step code is
//! derived with HMAC-SHA1, the same construction the upstream client library
//! uses for its Steam Guard mobile codes.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use byteorder::{BigEndian, WriteBytesExt};
use hmac::{Hmac, Mac};
use sha1::Sha1;

const CODE_ALPHABET: &[u8] = b"23456789BCDFGHJKMNPQRTVWXY";
const CODE_LEN: usize = 5;
const TIME_STEP_SECS: u64 = 30;

type HmacSha1 = Hmac<Sha1>;

/// Either a short static code or a shared secret to derive one from.
#[derive(Debug, Clone)]
pub enum AuthSecret {
	Static(String),
	Shared(String),
}

impl AuthSecret {
	pub fn classify(raw: &str) -> Self {
		if raw.len() <= 5 {
			AuthSecret::Static(raw.to_string())
		} else {
			AuthSecret::Shared(raw.to_string())
		}
	}
}

/// Resolve the code to send at login time, given an explicit override, the
/// account's configured secret (if any), and the current unix time.
///
/// An explicit `one_time_code` always wins, matching C1's contract: "An
/// explicit oneTimeCode overrides both."
pub fn resolve_login_code(
	one_time_code: Option<&str>,
	secret: Option<&AuthSecret>,
	now_unix_secs: u64,
) -> Option<String> {
	if let Some(code) = one_time_code {
		return Some(code.to_string());
	}
	match secret {
		Some(AuthSecret::Static(code)) => Some(code.clone()),
		Some(AuthSecret::Shared(shared)) => generate_time_code(shared, now_unix_secs).ok(),
		None => None,
	}
}

fn generate_time_code(shared_secret_b64: &str, now_unix_secs: u64) -> Result<String, anyhow::Error> {
	let key = STANDARD.decode(shared_secret_b64.trim())?;
	let counter = now_unix_secs / TIME_STEP_SECS;
	let mut counter_bytes = Vec::with_capacity(8);
	counter_bytes.write_u64::<BigEndian>(counter)?;

	let mut mac = HmacSha1::new_from_slice(&key)?;
	mac.update(&counter_bytes);
	let digest = mac.finalize().into_bytes();

	let offset = (digest[19] & 0x0f) as usize;
	let mut value = ((digest[offset] & 0x7f) as u32) << 24
		| (digest[offset + 1] as u32) << 16
		| (digest[offset + 2] as u32) << 8
		| (digest[offset + 3] as u32);

	let mut code = String::with_capacity(CODE_LEN);
	for _ in 0..CODE_LEN {
		let idx = (value as usize) % CODE_ALPHABET.len();
		code.push(CODE_ALPHABET[idx] as char);
		value /= CODE_ALPHABET.len() as u32;
	}
	Ok(code)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn classifies_short_secret_as_static() {
		match AuthSecret::classify("AB12C") {
			AuthSecret::Static(s) => assert_eq!(s, "AB12C"),
			AuthSecret::Shared(_) => panic!("expected static"),
		}
	}

	#[test]
	fn classifies_long_secret_as_shared() {
		match AuthSecret::classify("dGhpc2lzYWZha2VzaGFyZWRzZWNyZXQ=") {
			AuthSecret::Shared(_) => {},
			AuthSecret::Static(_) => panic!("expected shared"),
		}
	}

	#[test]
	fn explicit_code_overrides_secret() {
		let secret = AuthSecret::Static("ZZZZZ".to_string());
		let resolved = resolve_login_code(Some("OVERRIDE"), Some(&secret), 0);
		assert_eq!(resolved.as_deref(), Some("OVERRIDE"));
	}

	#[test]
	fn static_secret_used_verbatim() {
		let secret = AuthSecret::Static("ZZZZZ".to_string());
		let resolved = resolve_login_code(None, Some(&secret), 0);
		assert_eq!(resolved.as_deref(), Some("ZZZZZ"));
	}

	#[test]
	fn shared_secret_produces_five_char_code_from_alphabet() {
		let raw = STANDARD.encode(b"0123456789abcdef");
		let secret = AuthSecret::Shared(raw);
		let resolved = resolve_login_code(None, Some(&secret), 1_700_000_000).unwrap();
		assert_eq!(resolved.len(), CODE_LEN);
		assert!(resolved.bytes().all(|b| CODE_ALPHABET.contains(&b)));
	}

	#[test]
	fn shared_secret_is_stable_within_time_step() {
		let raw = STANDARD.encode(b"0123456789abcdef");
		let secret = AuthSecret::Shared(raw);
		let a = resolve_login_code(None, Some(&secret), 1_700_000_000).unwrap();
		let b = resolve_login_code(None, Some(&secret), 1_700_000_010).unwrap();
		assert_eq!(a, b);
	}

	#[test]
	fn shared_secret_changes_across_time_step() {
		let raw = STANDARD.encode(b"0123456789abcdef");
		let secret = AuthSecret::Shared(raw);
		let a = resolve_login_code(None, Some(&secret), 1_700_000_000).unwrap();
		let b = resolve_login_code(None, Some(&secret), 1_700_000_031).unwrap();
		assert_ne!(a, b);
	}
}
