use std::{
    fmt::Display,
    ops::Deref,
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::{de::Visitor, Deserialize, Serialize};
use sha1::{Digest, Sha1};

pub mod peer;
pub mod tracker;

/// Single file entry when the torrent describes a directory
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct File {
    pub length: u64,
    pub path: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeDescriptor {
    Files(Vec<File>),
    Length(u64),
}

/// Torrent output file that is normalized and safe against path attack
#[derive(Clone, Debug)]
pub struct OutputFile {
    length: u64,
    path: PathBuf,
}

impl OutputFile {
    pub fn new(length: u64, path: PathBuf) -> Self {
        Self { length, path }
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

/// Info dictionary is a unique descriptor of the particular torrent.
/// Sha1 hash of its raw bencoded bytes is the swarm identifier.
#[derive(Debug, Clone, Deserialize)]
pub struct Info {
    #[serde(skip)]
    pub raw: bytes::Bytes,
    #[serde(flatten)]
    pub file_descriptor: SizeDescriptor,
    /// Single file case: name of the file. Multi file case: name of the root directory.
    pub name: String,
    #[serde(rename = "piece length")]
    pub piece_length: u32,
    pub pieces: Hashes,
}

impl bendy::decoding::FromBencode for Info {
    fn decode_bencode_object(
        object: bendy::decoding::Object,
    ) -> Result<Self, bendy::decoding::Error> {
        let dict_dec = object.try_into_dictionary()?;
        let raw = bytes::Bytes::copy_from_slice(dict_dec.into_raw()?);

        let mut info: Info = serde_bencode::from_bytes(&raw)?;
        info.raw = raw;
        Ok(info)
    }
}

impl Display for Info {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Name: {}", self.name)?;
        writeln!(
            f,
            "Pieces: {} x {} bytes, {} bytes total",
            self.pieces.len(),
            self.piece_length,
            self.total_size(),
        )?;
        let output_files = self.output_files("");
        writeln!(f, "Files ({}):", output_files.len())?;
        for file in output_files {
            writeln!(f, "   {}: {} bytes", file.path.display(), file.length())?;
        }
        Ok(())
    }
}

impl Info {
    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        bendy::decoding::FromBencode::from_bencode(bytes).map_err(|e| anyhow::anyhow!("{e}"))
    }

    pub fn total_size(&self) -> u64 {
        match &self.file_descriptor {
            SizeDescriptor::Files(files) => files.iter().map(|f| f.length).sum(),
            SizeDescriptor::Length(length) => *length,
        }
    }

    /// Piece length taking the short last piece into account
    pub fn piece_len(&self, piece: u32) -> u32 {
        let total = self.total_size();
        let start = piece as u64 * self.piece_length as u64;
        u64::min(self.piece_length as u64, total - start) as u32
    }

    pub fn output_files(&self, output_dir: impl AsRef<Path>) -> Vec<OutputFile> {
        let base = output_dir.as_ref().join(&self.name);
        match &self.file_descriptor {
            SizeDescriptor::Files(files) => files
                .iter()
                .map(|f| {
                    OutputFile::new(
                        f.length,
                        base.join(sanitize_path(PathBuf::from_iter(f.path.iter()))),
                    )
                })
                .collect(),
            SizeDescriptor::Length(length) => {
                vec![OutputFile::new(*length, base)]
            }
        }
    }

    pub fn hash(&self) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(&self.raw);
        hasher.finalize().into()
    }

    pub fn hex_hash(&self) -> String {
        hex::encode(self.hash())
    }
}

/// List of piece hashes
#[derive(Debug, Clone)]
pub struct Hashes(pub Arc<[[u8; 20]]>);

impl Deref for Hashes {
    type Target = [[u8; 20]];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

struct HashesVisitor;

impl Visitor<'_> for HashesVisitor {
    type Value = Hashes;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str("byte string with length divisible by 20")
    }

    fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        if v.len() % 20 != 0 {
            return Err(serde::de::Error::custom(
                "payload is not multiple of 20 bytes long",
            ));
        }
        let chunks = v
            .chunks_exact(20)
            .map(|chunk| chunk.try_into().unwrap())
            .collect();
        Ok(Hashes(chunks))
    }
}

impl<'de> Deserialize<'de> for Hashes {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_bytes(HashesVisitor)
    }
}

impl Serialize for Hashes {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_bytes(&self.0.concat())
    }
}

/// Prevent traversal attack on path by ignoring suspicious components
fn sanitize_path(path: PathBuf) -> PathBuf {
    use std::path::Component;
    let mut normalized_path = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) => {
                tracing::warn!("Path starts with prefix component");
            }
            Component::RootDir => {
                tracing::warn!("Path starts with root directory component");
            }
            Component::CurDir | Component::ParentDir => {
                tracing::warn!("Path contains relative directory component");
            }
            Component::Normal(component) => normalized_path.push(component),
        }
    }
    normalized_path
}

#[derive(Debug)]
pub struct TorrentFile {
    pub info: Info,
    /// The URL of the tracker.
    pub announce: String,
    /// Tiered tracker list
    pub announce_list: Option<Vec<Vec<String>>>,
    pub creation_date: Option<u64>,
    pub comment: Option<String>,
    pub created_by: Option<String>,
}

impl bendy::decoding::FromBencode for TorrentFile {
    fn decode_bencode_object(
        object: bendy::decoding::Object,
    ) -> Result<Self, bendy::decoding::Error> {
        use bendy::decoding::Error;
        use bendy::decoding::FromBencode;
        use bendy::decoding::ResultExt;

        let mut announce = None;
        let mut announce_list = None;
        let mut comment = None;
        let mut creation_date = None;
        let mut created_by = None;
        let mut info = None;

        let mut dict_dec = object.try_into_dictionary()?;
        while let Some((tag, value)) = dict_dec.next_pair()? {
            match tag {
                b"announce" => {
                    announce = String::decode_bencode_object(value)
                        .context("announce")
                        .map(Some)?;
                }
                b"announce-list" => {
                    announce_list = Vec::decode_bencode_object(value)
                        .context("announce-list")
                        .map(Some)?;
                }
                b"comment" => {
                    comment = String::decode_bencode_object(value)
                        .context("comment")
                        .map(Some)?;
                }
                b"creation date" => {
                    creation_date = u64::decode_bencode_object(value)
                        .context("creation_date")
                        .map(Some)?;
                }
                b"created by" => {
                    created_by = String::decode_bencode_object(value)
                        .context("created_by")
                        .map(Some)?;
                }
                b"info" => {
                    info = Info::decode_bencode_object(value).context("info").map(Some)?;
                }
                _ => {
                    tracing::debug!(
                        "Unexpected field in .torrent file: {}",
                        String::from_utf8_lossy(tag)
                    );
                }
            }
        }

        let announce = announce.ok_or_else(|| Error::missing_field("announce"))?;
        let info = info.ok_or_else(|| Error::missing_field("info"))?;

        Ok(Self {
            announce,
            announce_list,
            info,
            comment,
            creation_date,
            created_by,
        })
    }
}

impl TorrentFile {
    pub fn from_bytes(bytes: impl AsRef<[u8]>) -> anyhow::Result<Self> {
        bendy::decoding::FromBencode::from_bencode(bytes.as_ref())
            .map_err(|e| anyhow::anyhow!("{e}"))
    }

    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(bytes)
    }

    /// All trackers contained in the file, announce first
    pub fn all_trackers(&self) -> Vec<reqwest::Url> {
        let mut trackers =
            Vec::with_capacity(1 + self.announce_list.as_ref().map_or(0, |l| l.len()));
        if let Ok(url) = reqwest::Url::parse(&self.announce) {
            trackers.push(url);
        } else {
            tracing::error!(self.announce, "failed to parse announce url");
        }
        if let Some(list) = &self.announce_list {
            for url in list.iter().flatten().filter_map(|url| reqwest::Url::parse(url).ok()) {
                if !trackers.contains(&url) {
                    trackers.push(url);
                }
            }
        };
        trackers
    }
}
