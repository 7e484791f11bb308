//! bitshare packet types: Seed announcement, Discovery request, Discovery response.
//! Framing lives in the wire module; this module owns each variant's payload.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::manifest::{Manifest, ManifestError};
use crate::seed::Seed;

/// Version byte leading every Seed payload.
pub const SEED_PAYLOAD_VERSION: u8 = 1;

/// Width of the on-wire type tag.
pub const TYPE_TAG_LEN: usize = 4;

/// Closed set of packet types. The 4-byte codes are part of the wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Seed,
    DiscoveryRequest,
    DiscoveryResponse,
}

impl PacketType {
    pub const ALL: [PacketType; 3] = [
        PacketType::Seed,
        PacketType::DiscoveryRequest,
        PacketType::DiscoveryResponse,
    ];

    pub fn code(self) -> &'static str {
        match self {
            PacketType::Seed => "SEED",
            PacketType::DiscoveryRequest => "DREQ",
            PacketType::DiscoveryResponse => "DRES",
        }
    }

    /// Code truncated/NUL-padded to exactly [`TYPE_TAG_LEN`] bytes.
    pub fn tag(self) -> [u8; TYPE_TAG_LEN] {
        let mut tag = [0u8; TYPE_TAG_LEN];
        let code = self.code().as_bytes();
        let n = code.len().min(TYPE_TAG_LEN);
        tag[..n].copy_from_slice(&code[..n]);
        tag
    }

    /// Match a received tag (trailing NULs stripped) against the known codes.
    pub fn from_tag(tag: &[u8]) -> Result<Self, PacketError> {
        let end = tag.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
        let trimmed = &tag[..end];
        PacketType::ALL
            .into_iter()
            .find(|t| t.code().as_bytes() == trimmed)
            .ok_or_else(|| PacketError::UnknownType(String::from_utf8_lossy(trimmed).into_owned()))
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A typed packet. The variant is decided once, from the tag, at decode time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Seed(SeedPacket),
    DiscoveryRequest(DiscoveryRequestPacket),
    DiscoveryResponse(DiscoveryResponsePacket),
}

impl Packet {
    /// Wrap a raw payload in the variant selected by `kind`. Payload contents are
    /// only interpreted by the variant accessors.
    pub fn from_parts(kind: PacketType, payload: Vec<u8>) -> Self {
        match kind {
            PacketType::Seed => Packet::Seed(SeedPacket { payload }),
            PacketType::DiscoveryRequest => {
                Packet::DiscoveryRequest(DiscoveryRequestPacket { payload })
            }
            PacketType::DiscoveryResponse => {
                Packet::DiscoveryResponse(DiscoveryResponsePacket { payload })
            }
        }
    }

    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Seed(_) => PacketType::Seed,
            Packet::DiscoveryRequest(_) => PacketType::DiscoveryRequest,
            Packet::DiscoveryResponse(_) => PacketType::DiscoveryResponse,
        }
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            Packet::Seed(p) => &p.payload,
            Packet::DiscoveryRequest(p) => &p.payload,
            Packet::DiscoveryResponse(p) => &p.payload,
        }
    }
}

impl From<SeedPacket> for Packet {
    fn from(p: SeedPacket) -> Self {
        Packet::Seed(p)
    }
}

impl From<DiscoveryRequestPacket> for Packet {
    fn from(p: DiscoveryRequestPacket) -> Self {
        Packet::DiscoveryRequest(p)
    }
}

impl From<DiscoveryResponsePacket> for Packet {
    fn from(p: DiscoveryResponsePacket) -> Self {
        Packet::DiscoveryResponse(p)
    }
}

/// Seed payload body after the version byte (bincode, default options).
#[derive(Serialize, Deserialize)]
struct SeedRecord {
    name: String,
    filelist: Vec<(String, u64)>,
    hash: String,
    path: String,
}

/// Seed announcement sent to the local daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedPacket {
    payload: Vec<u8>,
}

impl SeedPacket {
    pub fn from_seed(seed: &Seed) -> Result<Self, PacketError> {
        let manifest = seed.manifest();
        let record = SeedRecord {
            name: manifest.name().to_string(),
            filelist: manifest.filelist().to_vec(),
            hash: manifest.hash(),
            path: seed
                .path()
                .to_str()
                .ok_or(PacketError::NonUtf8Path)?
                .to_string(),
        };
        let body = bincode::serialize(&record).map_err(PacketError::Malformed)?;
        let mut payload = Vec::with_capacity(1 + body.len());
        payload.push(SEED_PAYLOAD_VERSION);
        payload.extend_from_slice(&body);
        Ok(Self { payload })
    }

    /// Decode and validate the carried seed. The carried hash must match the manifest.
    pub fn seed(&self) -> Result<Seed, PacketError> {
        let (&version, body) = self.payload.split_first().ok_or(PacketError::Empty)?;
        if version != SEED_PAYLOAD_VERSION {
            return Err(PacketError::UnsupportedVersion(version));
        }
        let record: SeedRecord = bincode::deserialize(body).map_err(PacketError::Malformed)?;
        let manifest = Manifest::new(record.name, record.filelist);
        manifest.verify_hash(&record.hash)?;
        Ok(Seed::new(manifest, record.path))
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// LAN broadcast asking who holds a content hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryRequestPacket {
    payload: Vec<u8>,
}

impl DiscoveryRequestPacket {
    pub fn from_hash(hash: &str) -> Self {
        Self {
            payload: hash.as_bytes().to_vec(),
        }
    }

    pub fn hash(&self) -> Result<String, PacketError> {
        decode_hash(&self.payload)
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// Unicast answer confirming a content hash is available at the sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryResponsePacket {
    payload: Vec<u8>,
}

impl DiscoveryResponsePacket {
    pub fn from_seed(seed: &Seed) -> Self {
        Self::from_hash(&seed.hash())
    }

    pub fn from_hash(hash: &str) -> Self {
        Self {
            payload: hash.as_bytes().to_vec(),
        }
    }

    pub fn hash(&self) -> Result<String, PacketError> {
        decode_hash(&self.payload)
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

fn decode_hash(payload: &[u8]) -> Result<String, PacketError> {
    if payload.is_empty() {
        return Err(PacketError::Empty);
    }
    String::from_utf8(payload.to_vec()).map_err(|_| PacketError::InvalidUtf8)
}

/// Payload interpretation failure (validation error).
#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("unknown packet type {0:?}")]
    UnknownType(String),
    #[error("empty payload")]
    Empty,
    #[error("unsupported seed payload version {0}")]
    UnsupportedVersion(u8),
    #[error("malformed seed payload: {0}")]
    Malformed(bincode::Error),
    #[error("hash payload is not valid utf-8")]
    InvalidUtf8,
    #[error("seed path is not valid utf-8")]
    NonUtf8Path,
    #[error("seed failed validation: {0}")]
    Manifest(#[from] ManifestError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_seed() -> Seed {
        let manifest = Manifest::new(
            "photos",
            vec![
                ("photos/2024/a.jpg".to_string(), 4096),
                ("photos/2024/b.jpg".to_string(), 8192),
            ],
        );
        Seed::new(manifest, "/srv/share/photos")
    }

    #[test]
    fn tags_are_four_bytes() {
        assert_eq!(&PacketType::Seed.tag(), b"SEED");
        assert_eq!(&PacketType::DiscoveryRequest.tag(), b"DREQ");
        assert_eq!(&PacketType::DiscoveryResponse.tag(), b"DRES");
    }

    #[test]
    fn from_tag_strips_trailing_nul() {
        assert_eq!(
            PacketType::from_tag(b"DREQ").unwrap(),
            PacketType::DiscoveryRequest
        );
        assert!(matches!(
            PacketType::from_tag(b"SEE\0"),
            Err(PacketError::UnknownType(code)) if code == "SEE"
        ));
        assert!(matches!(
            PacketType::from_tag(b"XXXX"),
            Err(PacketError::UnknownType(_))
        ));
    }

    #[test]
    fn every_tag_selects_its_variant() {
        for kind in PacketType::ALL {
            let tag = kind.tag();
            let packet = Packet::from_parts(PacketType::from_tag(&tag).unwrap(), vec![]);
            assert_eq!(packet.packet_type(), kind);
        }
    }

    #[test]
    fn seed_packet_carries_seed() {
        let seed = sample_seed();
        let packet = SeedPacket::from_seed(&seed).unwrap();
        assert_eq!(packet.payload()[0], SEED_PAYLOAD_VERSION);
        let decoded = packet.seed().unwrap();
        assert_eq!(decoded, seed);
        assert_eq!(decoded.hash(), seed.hash());
    }

    #[cfg(unix)]
    #[test]
    fn seed_with_non_utf8_path_is_rejected() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let manifest = sample_seed().manifest().clone();
        let seed = Seed::new(manifest, OsStr::from_bytes(b"/srv/caf\xe9"));
        assert!(matches!(
            SeedPacket::from_seed(&seed),
            Err(PacketError::NonUtf8Path)
        ));
    }

    #[test]
    fn seed_accessor_rejects_non_seed_payload() {
        let packet = SeedPacket {
            payload: b"not a seed".to_vec(),
        };
        assert!(packet.seed().is_err());

        let empty = SeedPacket { payload: vec![] };
        assert!(matches!(empty.seed(), Err(PacketError::Empty)));
    }

    #[test]
    fn seed_accessor_rejects_unknown_version() {
        let mut packet = SeedPacket::from_seed(&sample_seed()).unwrap();
        packet.payload[0] = 9;
        assert!(matches!(
            packet.seed(),
            Err(PacketError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn seed_accessor_rejects_wrong_hash() {
        let record = SeedRecord {
            name: "photos".to_string(),
            filelist: vec![("photos/a.jpg".to_string(), 1)],
            hash: "f".repeat(64),
            path: "/tmp".to_string(),
        };
        let mut payload = vec![SEED_PAYLOAD_VERSION];
        payload.extend(bincode::serialize(&record).unwrap());
        let packet = SeedPacket { payload };
        assert!(matches!(packet.seed(), Err(PacketError::Manifest(_))));
    }

    #[test]
    fn discovery_packets_carry_hash() {
        let seed = sample_seed();
        let req = DiscoveryRequestPacket::from_hash(&seed.hash());
        assert_eq!(req.hash().unwrap(), seed.hash());
        let resp = DiscoveryResponsePacket::from_seed(&seed);
        assert_eq!(resp.hash().unwrap(), seed.hash());
        assert_eq!(req.payload(), resp.payload());
    }

    #[test]
    fn hash_accessor_rejects_bad_utf8() {
        let packet = Packet::from_parts(PacketType::DiscoveryRequest, vec![0xff, 0xfe]);
        match packet {
            Packet::DiscoveryRequest(p) => {
                assert!(matches!(p.hash(), Err(PacketError::InvalidUtf8)))
            }
            _ => panic!("expected DiscoveryRequest"),
        }
    }
}
