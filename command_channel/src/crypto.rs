// crypto.rs — session material handed over by the relay handshake
use anyhow::{bail, Context, Result};
use vehicle_protocol::{CipherSession, SessionMaterial};

use crate::config::Config;

/// Decode the hex secret and nonce and make sure a session can be keyed from them.
pub fn session_material(cfg: &Config) -> Result<SessionMaterial> {
    let secret = hex::decode(cfg.secret_hex.trim()).context("invalid secret_hex")?;
    let nonce = hex::decode(cfg.nonce_hex.trim()).context("invalid nonce_hex")?;
    if secret.is_empty() { bail!("secret_hex must not be empty"); }
    if nonce.is_empty() { bail!("nonce_hex must not be empty"); }
    let material = SessionMaterial::new(secret, nonce);
    CipherSession::open(&material)?;
    Ok(material)
}
