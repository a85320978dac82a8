//! Parsing of `.torrent` metainfo files.
//!
//! Only single file torrents are supported: the `info` dictionary must carry
//! a scalar `length`. Trackers in `announce` are recognized but never
//! contacted; the optional `nodes` list provides DHT bootstrap addresses in
//! path-aware host form as per BEP-5.

use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};

use crate::{addr::ScionAddr, error::*, Sha1Hash};

#[derive(Debug, Deserialize)]
pub struct Metainfo {
    pub announce: Option<String>,
    pub nodes: Option<Vec<(String, u16)>>,
    pub info: Info,
}

// Fields are declared in bencode key order so that re-encoding the info
// dictionary reproduces the bytes the info hash was computed over.
#[derive(Debug, Serialize, Deserialize)]
pub struct Info {
    pub length: Option<u64>,
    pub name: String,
    #[serde(rename = "piece length")]
    pub piece_length: u32,
    pub pieces: ByteBuf,
    pub private: Option<u8>,
}

impl Metainfo {
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let metainfo: Metainfo = serde_bencode::from_bytes(buf)?;
        if metainfo.info.length.is_none() {
            return Err(Error::Metainfo(
                "multi file torrents are not supported".into(),
            ));
        }
        Ok(metainfo)
    }

    /// The SHA-1 digest of the raw bencoded `info` dictionary.
    pub fn create_info_hash(&self) -> Result<Sha1Hash> {
        let info = serde_bencode::to_bytes(&self.info)?;
        let digest = Sha1::digest(&info);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);
        Ok(info_hash)
    }

    /// Splits the concatenated `pieces` string into per piece SHA-1 digests.
    pub fn piece_hashes(&self) -> Result<Vec<Sha1Hash>> {
        let buf = self.info.pieces.as_ref();
        if buf.len() % 20 != 0 {
            return Err(Error::Metainfo(format!(
                "malformed pieces of length {}",
                buf.len()
            )));
        }
        let mut hashes = Vec::with_capacity(buf.len() / 20);
        for chunk in buf.chunks_exact(20) {
            let mut hash = [0; 20];
            hash.copy_from_slice(chunk);
            hashes.push(hash);
        }
        Ok(hashes)
    }

    /// The total download length in bytes.
    pub fn total_len(&self) -> u64 {
        // presence is checked in `from_bytes`
        self.info.length.unwrap_or_default()
    }

    /// DHT bootstrap nodes from the `nodes` list, in path-aware host form.
    pub fn dht_nodes(&self) -> Result<Vec<ScionAddr>> {
        let nodes = match &self.nodes {
            Some(nodes) => nodes,
            None => return Ok(Vec::new()),
        };
        nodes
            .iter()
            .map(|(host, port)| ScionAddr::parse(&format!("{}:{}", host, port)))
            .collect()
    }
}
