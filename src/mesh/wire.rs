//! Link frame encoding
//!
//! Frames travel inside a length-delimited TCP stream:
//!
//! ```text
//! HELLO  [1: type] [8: magic] [1: version] [32: public key] [32: nonce]
//! PROOF  [1: type] [64: ed25519 signature over the peer's nonce]
//! DATA   [1: type] [32: destination key] [N: packet]
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use ed25519_dalek::Signature;

use super::{PublicKey, PUBLIC_KEY_LEN};

/// Frame types
pub const FRAME_HELLO: u8 = 0x01;
pub const FRAME_PROOF: u8 = 0x02;
pub const FRAME_DATA: u8 = 0x03;

/// Link protocol magic
pub const LINK_MAGIC: &[u8; 8] = b"WOLFMESH";

/// Link protocol version
pub const LINK_VERSION: u8 = 1;

/// Nonce length used in the hello exchange
pub const NONCE_LEN: usize = 32;

/// Domain separator mixed into handshake signatures
const PROOF_CONTEXT: &[u8] = b"wolfmesh-link-proof";

const HELLO_LEN: usize = 1 + 8 + 1 + PUBLIC_KEY_LEN + NONCE_LEN;
const PROOF_LEN: usize = 1 + 64;
const DATA_HEADER_LEN: usize = 1 + PUBLIC_KEY_LEN;

/// A single link frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Hello { key: PublicKey, nonce: [u8; NONCE_LEN] },
    Proof { signature: Signature },
    Data { dest: PublicKey, payload: Bytes },
}

impl Frame {
    pub fn encode(&self) -> Bytes {
        match self {
            Frame::Hello { key, nonce } => {
                let mut buf = BytesMut::with_capacity(HELLO_LEN);
                buf.put_u8(FRAME_HELLO);
                buf.put_slice(LINK_MAGIC);
                buf.put_u8(LINK_VERSION);
                buf.put_slice(key.as_bytes());
                buf.put_slice(nonce);
                buf.freeze()
            }
            Frame::Proof { signature } => {
                let mut buf = BytesMut::with_capacity(PROOF_LEN);
                buf.put_u8(FRAME_PROOF);
                buf.put_slice(&signature.to_bytes());
                buf.freeze()
            }
            Frame::Data { dest, payload } => {
                let mut buf = BytesMut::with_capacity(DATA_HEADER_LEN + payload.len());
                buf.put_u8(FRAME_DATA);
                buf.put_slice(dest.as_bytes());
                buf.put_slice(payload);
                buf.freeze()
            }
        }
    }

    /// Decode a frame; `None` for anything malformed or of another version
    pub fn decode(mut data: BytesMut) -> Option<Frame> {
        match *data.first()? {
            FRAME_HELLO => {
                if data.len() != HELLO_LEN || &data[1..9] != LINK_MAGIC || data[9] != LINK_VERSION {
                    return None;
                }
                let key = PublicKey::from_slice(&data[10..10 + PUBLIC_KEY_LEN]).ok()?;
                let nonce: [u8; NONCE_LEN] = data[10 + PUBLIC_KEY_LEN..].try_into().ok()?;
                Some(Frame::Hello { key, nonce })
            }
            FRAME_PROOF => {
                let bytes: [u8; 64] = data.get(1..)?.try_into().ok()?;
                Some(Frame::Proof { signature: Signature::from_bytes(&bytes) })
            }
            FRAME_DATA => {
                if data.len() < DATA_HEADER_LEN {
                    return None;
                }
                let dest = PublicKey::from_slice(&data[1..DATA_HEADER_LEN]).ok()?;
                let payload = data.split_off(DATA_HEADER_LEN).freeze();
                Some(Frame::Data { dest, payload })
            }
            _ => None,
        }
    }
}

/// Bytes signed by a node to prove it owns `signer`, bound to the nonce
/// chosen by the other side of the link
pub fn proof_message(peer_nonce: &[u8; NONCE_LEN], signer: &PublicKey) -> Vec<u8> {
    let mut msg = Vec::with_capacity(PROOF_CONTEXT.len() + NONCE_LEN + PUBLIC_KEY_LEN);
    msg.extend_from_slice(PROOF_CONTEXT);
    msg.extend_from_slice(peer_nonce);
    msg.extend_from_slice(signer.as_bytes());
    msg
}
