// cipher.rs — RC4 keystream + HMAC-MD5 session scoped to one relay connection

use hmac::{Hmac, Mac};
use md5::Md5;
use rc4::cipher::{KeyInit, StreamCipher, consts::U16};
use rc4::Rc4;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::ops::Range;

use crate::error::CipherError;
use crate::frame::{Frame, MAX_PAYLOAD};

type HmacMd5 = Hmac<Md5>;

pub const TAG_LEN: usize = 16;
/// Leading keystream bytes thrown away after keying (RC4-drop1024).
pub const KEYSTREAM_DROP: usize = 1024;

const LABEL_CLIENT_TO_RELAY: &[u8] = b"ovms-c2s";
const LABEL_RELAY_TO_CLIENT: &[u8] = b"ovms-s2c";
const LABEL_MAC: &[u8] = b"ovms-mac";

/// Accepted frames remembered with their keystream offset, so a replay still verifies.
const ACCEPTED_HISTORY: usize = 64;
/// How far ahead of the last accepted sequence a frame may be and still be resynchronised.
const RESYNC_WINDOW: u32 = 16;

/// The two precomputed values handed over by the connection handshake.
#[derive(Clone)]
pub struct SessionMaterial {
    shared_secret: Vec<u8>,
    session_nonce: Vec<u8>,
}

impl SessionMaterial {
    pub fn new(shared_secret: impl Into<Vec<u8>>, session_nonce: impl Into<Vec<u8>>) -> Self {
        Self {
            shared_secret: shared_secret.into(),
            session_nonce: session_nonce.into(),
        }
    }
}

impl fmt::Debug for SessionMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionMaterial")
            .field("shared_secret", &"<redacted>")
            .field("session_nonce_len", &self.session_nonce.len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToRelay,
    RelayToClient,
}

impl Direction {
    fn label(self) -> &'static [u8] {
        match self {
            Direction::ClientToRelay => LABEL_CLIENT_TO_RELAY,
            Direction::RelayToClient => LABEL_RELAY_TO_CLIENT,
        }
    }

    fn tag_byte(self) -> u8 {
        match self {
            Direction::ClientToRelay => 0x01,
            Direction::RelayToClient => 0x02,
        }
    }
}

/// Which side of the connection this session seals for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Client,
    Relay,
}

fn keyed(key: &[u8]) -> Result<HmacMd5, CipherError> {
    <HmacMd5 as Mac>::new_from_slice(key).map_err(|_| CipherError::InvalidMaterial("unusable HMAC key"))
}

/// HMAC-MD5(secret, nonce || label)
fn derive(secret: &HmacMd5, nonce: &[u8], label: &[u8]) -> [u8; 16] {
    let mut mac = secret.clone();
    mac.update(nonce);
    mac.update(label);
    let mut out = [0u8; 16];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// One direction's keystream. The cursor counts bytes consumed after the drop.
struct Keystream {
    rc4: Rc4<U16>,
    cursor: u64,
}

impl Keystream {
    fn new(key: [u8; 16]) -> Self {
        let mut rc4 = Rc4::<U16>::new(&key.into());
        let mut discard = [0u8; KEYSTREAM_DROP];
        rc4.apply_keystream(&mut discard);
        Self { rc4, cursor: 0 }
    }

    fn apply(&mut self, buf: &mut [u8]) -> Range<u64> {
        let start = self.cursor;
        self.rc4.apply_keystream(buf);
        self.cursor += buf.len() as u64;
        start..self.cursor
    }

    /// Burn `n` bytes the peer spent on frames this side never accepted.
    fn skip(&mut self, mut n: u64) {
        let mut scratch = [0u8; 1024];
        while n > 0 {
            let step = n.min(scratch.len() as u64) as usize;
            self.apply(&mut scratch[..step]);
            n -= step as u64;
        }
    }
}

/// Output of [`CipherSession::seal`]: ready to be wrapped into a [`Frame`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub sequence: u32,
    pub correlation_token: u32,
    /// ciphertext || tag
    pub payload: Vec<u8>,
    /// Outbound keystream bytes consumed by this seal.
    pub keystream: Range<u64>,
}

impl Sealed {
    pub fn into_frame(self) -> Frame {
        Frame::wrap(self.sequence, self.correlation_token, self.payload)
    }
}

pub struct CipherSession {
    outbound_dir: Direction,
    inbound_dir: Direction,
    outbound: Keystream,
    inbound: Keystream,
    mac: HmacMd5,
    last_sent: u32,
    last_accepted: u32,
    /// (sequence, keystream start) of recently accepted frames.
    accepted: VecDeque<(u32, u64)>,
    /// Ciphertext length of frames ahead of `last_accepted` that failed to verify.
    unverified: BTreeMap<u32, usize>,
}

impl fmt::Debug for CipherSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherSession")
            .field("outbound_dir", &self.outbound_dir)
            .field("outbound_cursor", &self.outbound.cursor)
            .field("inbound_cursor", &self.inbound.cursor)
            .field("last_sent", &self.last_sent)
            .field("last_accepted", &self.last_accepted)
            .finish_non_exhaustive()
    }
}

impl CipherSession {
    /// Client side of a fresh connection.
    pub fn open(material: &SessionMaterial) -> Result<Self, CipherError> {
        Self::open_as(material, Endpoint::Client)
    }

    pub fn open_as(material: &SessionMaterial, endpoint: Endpoint) -> Result<Self, CipherError> {
        if material.shared_secret.is_empty() {
            return Err(CipherError::InvalidMaterial("shared secret is empty"));
        }
        if material.session_nonce.is_empty() {
            return Err(CipherError::InvalidMaterial("session nonce is empty"));
        }
        let (outbound_dir, inbound_dir) = match endpoint {
            Endpoint::Client => (Direction::ClientToRelay, Direction::RelayToClient),
            Endpoint::Relay => (Direction::RelayToClient, Direction::ClientToRelay),
        };
        let secret = keyed(&material.shared_secret)?;
        let nonce = &material.session_nonce;

        Ok(Self {
            outbound_dir,
            inbound_dir,
            outbound: Keystream::new(derive(&secret, nonce, outbound_dir.label())),
            inbound: Keystream::new(derive(&secret, nonce, inbound_dir.label())),
            mac: keyed(&derive(&secret, nonce, LABEL_MAC))?,
            last_sent: 0,
            last_accepted: 0,
            accepted: VecDeque::with_capacity(ACCEPTED_HISTORY),
            unverified: BTreeMap::new(),
        })
    }

    /// Client and relay sessions over the same material.
    pub fn pair(material: &SessionMaterial) -> Result<(Self, Self), CipherError> {
        Ok((
            Self::open_as(material, Endpoint::Client)?,
            Self::open_as(material, Endpoint::Relay)?,
        ))
    }

    pub fn outbound_cursor(&self) -> u64 {
        self.outbound.cursor
    }

    pub fn inbound_cursor(&self) -> u64 {
        self.inbound.cursor
    }

    pub fn last_accepted(&self) -> u32 {
        self.last_accepted
    }

    fn tag(&self, dir: Direction, sequence: u32, token: u32, offset: u64, ciphertext: &[u8]) -> HmacMd5 {
        let mut mac = self.mac.clone();
        mac.update(&[dir.tag_byte()]);
        mac.update(&sequence.to_be_bytes());
        mac.update(&token.to_be_bytes());
        mac.update(&offset.to_be_bytes());
        mac.update(ciphertext);
        mac
    }

    /// Keystream offset the peer must have sealed `sequence` at, when it can be known:
    /// the current cursor plus every skipped frame in between, or the recorded start
    /// of an already accepted frame.
    fn inbound_offset(&self, sequence: u32) -> Option<u64> {
        if sequence <= self.last_accepted {
            return self
                .accepted
                .iter()
                .find(|(s, _)| *s == sequence)
                .map(|(_, offset)| *offset);
        }
        if sequence - self.last_accepted > RESYNC_WINDOW {
            return None;
        }
        let mut offset = self.inbound.cursor;
        for skipped in self.last_accepted + 1..sequence {
            offset += *self.unverified.get(&skipped)? as u64;
        }
        Some(offset)
    }

    /// Encrypt and authenticate the next outbound message.
    pub fn seal(&mut self, correlation_token: u32, plaintext: &[u8]) -> Result<Sealed, CipherError> {
        if plaintext.len() + TAG_LEN > MAX_PAYLOAD {
            return Err(CipherError::PlaintextTooLarge(plaintext.len()));
        }
        let sequence = self
            .last_sent
            .checked_add(1)
            .ok_or(CipherError::SequenceExhausted)?;

        let mut payload = Vec::with_capacity(plaintext.len() + TAG_LEN);
        payload.extend_from_slice(plaintext);
        let keystream = self.outbound.apply(&mut payload);
        let tag = self
            .tag(self.outbound_dir, sequence, correlation_token, keystream.start, &payload)
            .finalize()
            .into_bytes();
        payload.extend_from_slice(&tag);
        self.last_sent = sequence;

        Ok(Sealed {
            sequence,
            correlation_token,
            payload,
            keystream,
        })
    }

    /// Verify, replay-check and decrypt one inbound frame, in that order.
    /// Nothing is decrypted and the keystream does not move unless both checks pass.
    ///
    /// The tag binds the keystream offset the frame was sealed at. A frame that
    /// fails verification has its length noted under its sequence number, so the
    /// next authentic frame can skip the keystream it used and the session
    /// survives one corrupted frame. A frame lost outright cannot be skipped
    /// and every later frame fails verification.
    pub fn open_frame(&mut self, frame: &Frame) -> Result<Vec<u8>, CipherError> {
        let Some(split) = frame.payload.len().checked_sub(TAG_LEN) else {
            return Err(CipherError::AuthenticationFailed);
        };
        let (ciphertext, tag) = frame.payload.split_at(split);

        let verified = self.inbound_offset(frame.sequence).filter(|&offset| {
            self.tag(self.inbound_dir, frame.sequence, frame.correlation_token, offset, ciphertext)
                .verify_slice(tag)
                .is_ok()
        });
        let Some(offset) = verified else {
            if frame.sequence > self.last_accepted && frame.sequence - self.last_accepted <= RESYNC_WINDOW {
                self.unverified.insert(frame.sequence, ciphertext.len());
            }
            return Err(CipherError::AuthenticationFailed);
        };

        if frame.sequence <= self.last_accepted {
            return Err(CipherError::ReplayRejected {
                sequence: frame.sequence,
                last_accepted: self.last_accepted,
            });
        }

        self.inbound.skip(offset - self.inbound.cursor);
        let mut plaintext = ciphertext.to_vec();
        let keystream = self.inbound.apply(&mut plaintext);
        self.last_accepted = frame.sequence;
        self.unverified.retain(|&s, _| s > frame.sequence);
        if self.accepted.len() == ACCEPTED_HISTORY {
            self.accepted.pop_front();
        }
        self.accepted.push_back((frame.sequence, keystream.start));
        Ok(plaintext)
    }
}
