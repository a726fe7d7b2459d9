//! Framed messaging on a byte stream.
//!
//! Every frame opens with three decimal sizes and a newline:
//!
//! ```text
//! <n0>,<n1>,<n2>\n<header-bytes><body-bytes><address-bytes>\n
//! ```
//!
//! `n0` is the header length, `n1` the body length, `n2` the total
//! payload length, which is the sealed length when the session is
//! encrypted; in that case the whole `header|body|addresses` concatenation is
//! sealed as a unit. Announced sizes beyond the caps end the session.

use bytes::BufMut;
use bytes::BytesMut;
use serde::Deserialize;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;

use crate::address::Address;
use crate::error::TransportError;
use crate::seal::Opener;
use crate::seal::Sealer;

/// Hard per-frame payload cap.
pub const FRAME_CAP: usize = 1_048_576;

/// Longest acceptable size line, newline excluded.
pub const DIGIT_CAP: usize = 23;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireHeader {
	pub to_address: Address,
	pub return_address: Address,
	#[serde(default)]
	pub tunnel: bool,
}

#[derive(Clone, Debug)]
pub struct WireFrame {
	pub header: WireHeader,
	pub body: Vec<u8>,
	pub addresses: Vec<Address>,
}

impl WireFrame {
	pub fn new(header: WireHeader, body: Vec<u8>, addresses: Vec<Address>) -> Self {
		Self {
			header,
			body,
			addresses,
		}
	}
}

/// The pluggable stream seam: anything that can move whole frames.
/// The TCP engine uses [`read_frame`]/[`write_frame`] on socket
/// halves; an HTTP adapter substitutes its own framing here.
pub trait FrameStream: Send {
	fn read_frame(
		&mut self,
	) -> impl std::future::Future<Output = Result<WireFrame, TransportError>> + Send;

	fn write_frame(
		&mut self,
		frame: &WireFrame,
	) -> impl std::future::Future<Output = Result<(), TransportError>> + Send;
}

fn encode_addresses(addresses: &[Address]) -> Vec<u8> {
	let hops: Vec<&[crate::address::Hop]> = addresses.iter().map(|a| a.hops()).collect();
	serde_json::to_vec(&hops).unwrap_or_else(|_| b"[]".to_vec())
}

fn decode_addresses(bytes: &[u8]) -> Result<Vec<Address>, TransportError> {
	if bytes.is_empty() {
		return Ok(Vec::new());
	}
	let hops: Vec<Vec<crate::address::Hop>> =
		serde_json::from_slice(bytes).map_err(|e| TransportError::BadFrame {
			detail: format!("address vector: {e}"),
		})?;
	Ok(hops.into_iter().map(Address::from_hops).collect())
}

/// Write one frame, sealing the payload when keys are present.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
	writer: &mut W,
	frame: &WireFrame,
	keys: &mut Option<Sealer>,
) -> Result<(), TransportError> {
	let header = serde_json::to_vec(&frame.header).map_err(|e| TransportError::BadFrame {
		detail: format!("header: {e}"),
	})?;
	let addresses = encode_addresses(&frame.addresses);

	let n0 = header.len();
	let n1 = frame.body.len();

	let mut payload = Vec::with_capacity(n0 + n1 + addresses.len());
	payload.extend_from_slice(&header);
	payload.extend_from_slice(&frame.body);
	payload.extend_from_slice(&addresses);

	if let Some(keys) = keys {
		payload = keys.seal(payload)?;
	}
	let n2 = payload.len();
	if n2 > FRAME_CAP {
		return Err(TransportError::FrameTooBig {
			announced: n2,
			cap: FRAME_CAP,
		});
	}

	let mut out = BytesMut::with_capacity(n2 + DIGIT_CAP + 2);
	out.put_slice(format!("{n0},{n1},{n2}\n").as_bytes());
	out.put_slice(&payload);
	out.put_u8(b'\n');
	writer.write_all(&out).await?;
	writer.flush().await?;
	Ok(())
}

/// Read one frame, unsealing when keys are present. Size violations
/// are fatal to the session by contract.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
	reader: &mut R,
	keys: &mut Option<Opener>,
) -> Result<WireFrame, TransportError> {
	let (n0, n1, n2) = read_sizes(reader).await?;
	if n2 > FRAME_CAP {
		return Err(TransportError::FrameTooBig {
			announced: n2,
			cap: FRAME_CAP,
		});
	}

	let mut payload = vec![0u8; n2];
	reader.read_exact(&mut payload).await?;
	let mut newline = [0u8; 1];
	reader.read_exact(&mut newline).await?;
	if newline[0] != b'\n' {
		return Err(TransportError::BadFrame {
			detail: "missing frame terminator".to_string(),
		});
	}

	if let Some(keys) = keys {
		payload = keys.open(payload)?;
	}
	if n0 + n1 > payload.len() {
		return Err(TransportError::BadFrame {
			detail: "sizes exceed the payload".to_string(),
		});
	}

	let header: WireHeader =
		serde_json::from_slice(&payload[..n0]).map_err(|e| TransportError::BadFrame {
			detail: format!("header: {e}"),
		})?;
	let body = payload[n0..n0 + n1].to_vec();
	let addresses = decode_addresses(&payload[n0 + n1..])?;

	Ok(WireFrame {
		header,
		body,
		addresses,
	})
}

async fn read_sizes<R: AsyncReadExt + Unpin>(
	reader: &mut R,
) -> Result<(usize, usize, usize), TransportError> {
	let mut line = Vec::with_capacity(DIGIT_CAP);
	loop {
		let byte = reader.read_u8().await?;
		if byte == b'\n' {
			break;
		}
		line.push(byte);
		if line.len() > DIGIT_CAP {
			return Err(TransportError::BadFrame {
				detail: "size line too long".to_string(),
			});
		}
	}
	let text = std::str::from_utf8(&line).map_err(|_| TransportError::BadFrame {
		detail: "size line is not text".to_string(),
	})?;
	let mut sizes = text.split(',').map(|part| part.parse::<usize>());
	let mut next = || {
		sizes
			.next()
			.and_then(|r| r.ok())
			.ok_or_else(|| TransportError::BadFrame {
				detail: format!("size line {text:?}"),
			})
	};
	let n0 = next()?;
	let n1 = next()?;
	let n2 = next()?;
	Ok((n0, n1, n2))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn frame_round_trip() {
		let frame = WireFrame::new(
			WireHeader {
				to_address: Address::from_hops(vec![3, 7]),
				return_address: Address::local(9),
				tunnel: false,
			},
			br#"{"value":null}"#.to_vec(),
			vec![Address::local(5)],
		);

		let mut buffer = Vec::new();
		write_frame(&mut buffer, &frame, &mut None).await.unwrap();

		let mut cursor = std::io::Cursor::new(buffer);
		let read = read_frame(&mut cursor, &mut None).await.unwrap();
		assert_eq!(read.header.to_address, frame.header.to_address);
		assert_eq!(read.header.return_address, frame.header.return_address);
		assert_eq!(read.body, frame.body);
		assert_eq!(read.addresses, frame.addresses);
	}

	#[tokio::test]
	async fn oversize_announcement_is_fatal() {
		let mut cursor = std::io::Cursor::new(b"1,1,99999999\nx".to_vec());
		let result = read_frame(&mut cursor, &mut None).await;
		assert!(matches!(result, Err(TransportError::FrameTooBig { .. })));
	}

	#[tokio::test]
	async fn runaway_size_line_is_fatal() {
		let mut cursor = std::io::Cursor::new(vec![b'1'; 64]);
		let result = read_frame(&mut cursor, &mut None).await;
		assert!(matches!(result, Err(TransportError::BadFrame { .. })));
	}
}
