//! bitshare core: manifests, seeds, packet types, wire framing and registries.
//! No sockets; the daemon crate owns all I/O.

pub mod manifest;
pub mod packager;
pub mod protocol;
pub mod registry;
pub mod seed;
pub mod wire;

pub use manifest::{Manifest, ManifestError};
pub use packager::{Packager, PackagerError, PIECE_SIZE};
pub use protocol::{
    DiscoveryRequestPacket, DiscoveryResponsePacket, Packet, PacketError, PacketType, SeedPacket,
};
pub use registry::{PeerRegistry, SeedRegistry};
pub use seed::Seed;
pub use wire::{
    decode_datagram, decode_frame, encode_datagram, encode_frame, FrameDecodeError,
    FrameEncodeError,
};
