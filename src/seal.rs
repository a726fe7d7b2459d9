//! Optional per-connection encryption.
//!
//! On connect the client opens with `Diffie{public_key}`; the
//! listener answers `Hellman{public_key}`; both derive the session
//! key from the X25519 agreement and from then on every frame payload
//! is sealed as a single unit. Handshake messages never reach the
//! application.

use ring::aead;
use ring::agreement;
use ring::digest;
use ring::rand::SystemRandom;

use crate::error::TransportError;

/// Which side of the handshake we are; nonces are namespaced by
/// direction so one key serves both ways.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
	Connecting,
	Listening,
}

pub struct Handshake {
	private: agreement::EphemeralPrivateKey,
	public: Vec<u8>,
	side: Side,
}

impl Handshake {
	pub fn new(side: Side) -> Result<Self, TransportError> {
		let rng = SystemRandom::new();
		let private = agreement::EphemeralPrivateKey::generate(&agreement::X25519, &rng)
			.map_err(|_| handshake_failed("key generation"))?;
		let public = private
			.compute_public_key()
			.map_err(|_| handshake_failed("public key"))?
			.as_ref()
			.to_vec();
		Ok(Self {
			private,
			public,
			side,
		})
	}

	pub fn public_key(&self) -> &[u8] {
		&self.public
	}

	/// Complete the agreement with the peer's public key and build
	/// the per-direction sealing state.
	pub fn agree(self, peer_public: &[u8]) -> Result<SessionKeys, TransportError> {
		let peer = agreement::UnparsedPublicKey::new(&agreement::X25519, peer_public);
		let key = agreement::agree_ephemeral(self.private, &peer, |secret| {
			digest::digest(&digest::SHA256, secret).as_ref().to_vec()
		})
		.map_err(|_| handshake_failed("agreement"))?;

		let sealing = aead::LessSafeKey::new(
			aead::UnboundKey::new(&aead::CHACHA20_POLY1305, &key)
				.map_err(|_| handshake_failed("sealing key"))?,
		);
		let opening = aead::LessSafeKey::new(
			aead::UnboundKey::new(&aead::CHACHA20_POLY1305, &key)
				.map_err(|_| handshake_failed("opening key"))?,
		);

		let (seal_direction, open_direction) = match self.side {
			Side::Connecting => (1, 2),
			Side::Listening => (2, 1),
		};

		Ok(SessionKeys {
			sealing,
			opening,
			seal_direction,
			open_direction,
		})
	}
}

pub struct SessionKeys {
	sealing: aead::LessSafeKey,
	opening: aead::LessSafeKey,
	seal_direction: u8,
	open_direction: u8,
}

impl SessionKeys {
	/// Split into the per-direction halves the reader and writer
	/// tasks own independently.
	pub fn split(self) -> (Sealer, Opener) {
		(
			Sealer {
				key: self.sealing,
				direction: self.seal_direction,
				counter: 0,
			},
			Opener {
				key: self.opening,
				direction: self.open_direction,
				counter: 0,
			},
		)
	}
}

fn nonce(direction: u8, counter: u64) -> aead::Nonce {
	let mut bytes = [0u8; aead::NONCE_LEN];
	bytes[0] = direction;
	bytes[4..].copy_from_slice(&counter.to_be_bytes());
	aead::Nonce::assume_unique_for_key(bytes)
}

pub struct Sealer {
	key: aead::LessSafeKey,
	direction: u8,
	counter: u64,
}

impl Sealer {
	pub fn seal(&mut self, mut payload: Vec<u8>) -> Result<Vec<u8>, TransportError> {
		let nonce = nonce(self.direction, self.counter);
		self.counter += 1;
		self.key
			.seal_in_place_append_tag(nonce, aead::Aad::empty(), &mut payload)
			.map_err(|_| handshake_failed("seal"))?;
		Ok(payload)
	}
}

pub struct Opener {
	key: aead::LessSafeKey,
	direction: u8,
	counter: u64,
}

impl Opener {
	pub fn open(&mut self, mut payload: Vec<u8>) -> Result<Vec<u8>, TransportError> {
		let nonce = nonce(self.direction, self.counter);
		self.counter += 1;
		let opened_len = self
			.key
			.open_in_place(nonce, aead::Aad::empty(), &mut payload)
			.map_err(|_| handshake_failed("open"))?
			.len();
		payload.truncate(opened_len);
		Ok(payload)
	}
}

fn handshake_failed(detail: &str) -> TransportError {
	TransportError::Handshake {
		detail: detail.to_string(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn both_sides_agree_and_frames_cross() {
		let client = Handshake::new(Side::Connecting).unwrap();
		let server = Handshake::new(Side::Listening).unwrap();
		let client_public = client.public_key().to_vec();
		let server_public = server.public_key().to_vec();

		let (mut client_seal, mut client_open) = client.agree(&server_public).unwrap().split();
		let (mut server_seal, mut server_open) = server.agree(&client_public).unwrap().split();

		let sealed = client_seal.seal(b"hello there".to_vec()).unwrap();
		assert_ne!(sealed, b"hello there".to_vec());
		let opened = server_open.open(sealed).unwrap();
		assert_eq!(opened, b"hello there".to_vec());

		// And the other direction, independently counted.
		let sealed = server_seal.seal(b"right back".to_vec()).unwrap();
		let opened = client_open.open(sealed).unwrap();
		assert_eq!(opened, b"right back".to_vec());
	}

	#[test]
	fn tampering_fails_to_open() {
		let client = Handshake::new(Side::Connecting).unwrap();
		let server = Handshake::new(Side::Listening).unwrap();
		let server_public = server.public_key().to_vec();
		let client_public = client.public_key().to_vec();

		let (mut client_seal, _) = client.agree(&server_public).unwrap().split();
		let (_, mut server_open) = server.agree(&client_public).unwrap().split();

		let mut sealed = client_seal.seal(b"payload".to_vec()).unwrap();
		sealed[0] ^= 0xff;
		assert!(server_open.open(sealed).is_err());
	}
}
