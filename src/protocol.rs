use base64::Engine as _;
use rand::{CryptoRng, RngCore};

use crate::domain::{Protocol, SsMethod};

// Xray-core's `xray x25519` uses base64.RawURLEncoding (no padding) for the private key input.
// Ref: XTLS/Xray-core `main/commands/all/x25519.go`.
pub const REALITY_X25519_PRIVATE_KEY_LEN_BYTES: usize = 32;

pub const TROJAN_PASSWORD_LEN_BYTES: usize = 18;
pub const SS_LEGACY_PASSWORD_LEN_BYTES: usize = 16;

pub fn validate_reality_server_name(host: &str) -> Result<(), &'static str> {
    let trimmed = host.trim();
    if trimmed.is_empty() {
        return Err("server_name is required");
    }
    if trimmed.chars().any(|c| c.is_whitespace()) {
        return Err("server_name must not contain spaces");
    }

    // Common copy/paste mistakes: URL / path / host:port / wildcard.
    if trimmed.contains("://") {
        return Err("server_name must not include scheme (://)");
    }
    if trimmed.contains('/') {
        return Err("server_name must not include path (/)");
    }
    if trimmed.contains(':') {
        return Err("server_name must not include port (:)");
    }
    if trimmed.contains('*') {
        return Err("server_name must not include wildcard (*)");
    }

    if trimmed.len() > 253 {
        return Err("server_name is too long (max 253)");
    }
    if trimmed.starts_with('.') || trimmed.ends_with('.') || trimmed.contains("..") {
        return Err("server_name has an empty label");
    }

    for label in trimmed.split('.') {
        if label.len() > 63 {
            return Err("server_name label is too long (max 63)");
        }
        let bytes = label.as_bytes();
        if bytes.first() == Some(&b'-') || bytes.last() == Some(&b'-') {
            return Err("server_name labels must not start/end with '-'");
        }
        if !label
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-')
        {
            return Err("server_name labels must be alnum or '-'");
        }
    }

    Ok(())
}

/// Reality destination is `host:port` or a bare port.
pub fn validate_reality_dest(dest: &str) -> Result<(), &'static str> {
    let dest = dest.trim();
    if dest.is_empty() {
        return Err("dest is required");
    }
    let port = match dest.rsplit_once(':') {
        Some((host, port)) => {
            if host.is_empty() {
                return Err("dest host must be non-empty");
            }
            port
        }
        None => dest,
    };
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err("dest must end with a valid port"),
        Ok(_) => Ok(()),
    }
}

pub fn validate_short_id(short_id: &str) -> Result<(), &'static str> {
    if short_id.is_empty() {
        return Err("short_id must be non-empty");
    }
    if short_id.len() > 16 {
        return Err("short_id length must be <= 16");
    }
    if !short_id.len().is_multiple_of(2) {
        return Err("short_id length must be even");
    }
    if !short_id.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err("short_id must be hex");
    }
    Ok(())
}

pub fn generate_short_id<R: RngCore + CryptoRng>(rng: &mut R) -> String {
    let mut bytes = [0u8; 8];
    rng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn generate_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn generate_trojan_password<R: RngCore + CryptoRng>(rng: &mut R) -> String {
    let mut bytes = [0u8; TROJAN_PASSWORD_LEN_BYTES];
    rng.fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Key material for a Shadowsocks user (or the server key of a 2022 inbound).
pub fn generate_ss_key<R: RngCore + CryptoRng>(method: SsMethod, rng: &mut R) -> String {
    match method.psk_len() {
        // sing-shadowsocks decodes 2022 keys with base64.StdEncoding and checks the raw length.
        Some(len) => {
            let mut key = vec![0u8; len];
            rng.fill_bytes(&mut key);
            base64::engine::general_purpose::STANDARD.encode(key)
        }
        None => {
            let mut key = [0u8; SS_LEGACY_PASSWORD_LEN_BYTES];
            rng.fill_bytes(&mut key);
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(key)
        }
    }
}

pub fn validate_ss_key(method: SsMethod, key: &str) -> Result<(), &'static str> {
    if key.is_empty() {
        return Err("key must be non-empty");
    }
    let Some(len) = method.psk_len() else {
        return Ok(());
    };
    match base64::engine::general_purpose::STANDARD.decode(key) {
        Ok(raw) if raw.len() == len => Ok(()),
        Ok(_) => Err("key has the wrong length for the method"),
        Err(_) => Err("key must be standard base64"),
    }
}

pub fn ss2022_password(server_psk_b64: &str, user_psk_b64: &str) -> String {
    format!("{server_psk_b64}:{user_psk_b64}")
}

/// Fresh identity matching what the protocol expects for a client.
pub fn generate_client_identity<R: RngCore + CryptoRng>(
    protocol: Protocol,
    ss_method: Option<SsMethod>,
    rng: &mut R,
) -> String {
    match protocol {
        Protocol::Vless | Protocol::Vmess => generate_uuid(),
        Protocol::Trojan => generate_trojan_password(rng),
        Protocol::Shadowsocks => generate_ss_key(ss_method.unwrap_or(SsMethod::Aes256Gcm), rng),
    }
}

pub fn validate_client_identity(
    protocol: Protocol,
    ss_method: Option<SsMethod>,
    identity: &str,
) -> Result<(), &'static str> {
    match protocol {
        Protocol::Vless | Protocol::Vmess => uuid::Uuid::parse_str(identity)
            .map(|_| ())
            .map_err(|_| "identity must be a UUID"),
        Protocol::Trojan => {
            if identity.is_empty() {
                return Err("password must be non-empty");
            }
            if identity.chars().any(|c| c.is_whitespace() || c.is_control()) {
                return Err("password must not contain whitespace");
            }
            Ok(())
        }
        Protocol::Shadowsocks => validate_ss_key(ss_method.unwrap_or(SsMethod::Aes256Gcm), identity),
    }
}

pub fn new_subscription_token<R: RngCore + CryptoRng>(rng: &mut R) -> String {
    let mut bytes = [0u8; 16];
    rng.fill_bytes(&mut bytes);
    format!("sub_{}", hex::encode(bytes))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealityKeypair {
    pub private_key: String,
    pub public_key: String,
}

#[derive(Debug)]
pub enum RealityKeypairError {
    Base64(base64::DecodeError),
    InvalidLength { expected: usize, got: usize },
}

impl std::fmt::Display for RealityKeypairError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Base64(e) => write!(f, "base64 decode error: {e}"),
            Self::InvalidLength { expected, got } => {
                write!(
                    f,
                    "invalid x25519 private key length: expected {expected}, got {got}"
                )
            }
        }
    }
}

impl std::error::Error for RealityKeypairError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Base64(e) => Some(e),
            Self::InvalidLength { .. } => None,
        }
    }
}

impl From<base64::DecodeError> for RealityKeypairError {
    fn from(value: base64::DecodeError) -> Self {
        Self::Base64(value)
    }
}

pub fn clamp_x25519_private_key_bytes(key: &mut [u8; REALITY_X25519_PRIVATE_KEY_LEN_BYTES]) {
    // https://cr.yp.to/ecdh.html (same algorithm used by Xray-core's `genCurve25519`)
    key[0] &= 248;
    key[31] &= 127;
    key[31] |= 64;
}

fn keypair_from_bytes(mut key: [u8; REALITY_X25519_PRIVATE_KEY_LEN_BYTES]) -> RealityKeypair {
    clamp_x25519_private_key_bytes(&mut key);

    let secret = x25519_dalek::StaticSecret::from(key);
    let public = x25519_dalek::PublicKey::from(&secret).to_bytes();

    RealityKeypair {
        private_key: base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(key),
        public_key: base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(public),
    }
}

pub fn reality_keypair_from_private_key(
    private_key_b64url_nopad: &str,
) -> Result<RealityKeypair, RealityKeypairError> {
    let key_bytes =
        base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(private_key_b64url_nopad.trim())?;
    let key: [u8; REALITY_X25519_PRIVATE_KEY_LEN_BYTES] =
        key_bytes
            .as_slice()
            .try_into()
            .map_err(|_| RealityKeypairError::InvalidLength {
                expected: REALITY_X25519_PRIVATE_KEY_LEN_BYTES,
                got: key_bytes.len(),
            })?;
    Ok(keypair_from_bytes(key))
}

pub fn generate_reality_keypair<R: RngCore + CryptoRng>(rng: &mut R) -> RealityKeypair {
    let mut key = [0u8; REALITY_X25519_PRIVATE_KEY_LEN_BYTES];
    rng.fill_bytes(&mut key);
    keypair_from_bytes(key)
}
