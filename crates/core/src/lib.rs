pub mod digest;
pub mod frame;
pub mod id;
pub mod info;
pub mod manifest;
pub mod wire;

pub use digest::{digest_bytes, Digest, DIGEST_LEN};
pub use frame::{Frame, FrameError, MsgType, HEADER_LEN, MAX_DATAGRAM, MAX_PAYLOAD};
pub use id::{ClusterId, PeerId, ID_LEN};
pub use info::{FileInfo, BLOCK_SIZE};
pub use manifest::{Manifest, MANIFEST_FILENAME};
