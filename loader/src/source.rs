//! Binary sources and chunked acquisition.
//!
//! A `BinarySource` names where the bytes come from. Opening it yields an
//! `Acquisition`: a chunk reader plus what the source said about itself
//! (content type, declared length) and whether the bytes may be compiled
//! while they stream.

use std::fmt;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

use crate::config::LoaderConfig;
use crate::error::TransportError;

/// MIME type that enables streaming compilation.
pub const WASM_CONTENT_TYPE: &str = "application/wasm";

/// Read size for file sources.
const FILE_CHUNK_SIZE: usize = 64 * 1024;

/// Sending half of a channel-fed source.
pub type ChunkSender = mpsc::Sender<Result<Bytes, TransportError>>;

/// Where the WebAssembly binary comes from.
pub enum BinarySource {
    /// `http`, `https` or `file` URL.
    Url(Url),
    /// Local file.
    File(PathBuf),
    /// Bytes already in memory. Always compiled from the buffer.
    Bytes(Bytes),
    /// Chunks pushed by the embedding, e.g. from a custom transport.
    Stream {
        content_type: Option<String>,
        chunks: mpsc::Receiver<Result<Bytes, TransportError>>,
    },
}

impl BinarySource {
    /// Parse a URL source.
    pub fn url(url: &str) -> Result<Self, TransportError> {
        Url::parse(url)
            .map(Self::Url)
            .map_err(|e| TransportError::InvalidUrl(format!("{}: {}", url, e)))
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File(path.into())
    }

    pub fn bytes(bytes: impl Into<Bytes>) -> Self {
        Self::Bytes(bytes.into())
    }

    /// A channel-fed source. The stream ends when every sender is dropped.
    pub fn channel(content_type: Option<&str>, capacity: usize) -> (ChunkSender, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let source = Self::Stream {
            content_type: content_type.map(str::to_string),
            chunks: rx,
        };
        (tx, source)
    }
}

impl fmt::Display for BinarySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url(url) => write!(f, "{}", url),
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Bytes(bytes) => write!(f, "<{} bytes in memory>", bytes.len()),
            Self::Stream { .. } => write!(f, "<stream>"),
        }
    }
}

impl fmt::Debug for BinarySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BinarySource({})", self)
    }
}

/// Whether a `Content-Type` value names the WebAssembly MIME type.
pub fn is_wasm_content_type(content_type: Option<&str>) -> bool {
    content_type
        .and_then(|ct| ct.split(';').next())
        .map(|mime| mime.trim().eq_ignore_ascii_case(WASM_CONTENT_TYPE))
        .unwrap_or(false)
}

enum ChunkReader {
    Http(reqwest::Response),
    File(tokio::fs::File),
    Memory(Option<Bytes>),
    Channel(mpsc::Receiver<Result<Bytes, TransportError>>),
}

/// An opened source.
pub(crate) struct Acquisition {
    reader: ChunkReader,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    /// The bytes may be compiled while they arrive.
    pub streamable: bool,
}

impl Acquisition {
    /// The whole binary is already in memory, so buffering costs nothing.
    pub fn in_memory(&self) -> bool {
        matches!(self.reader, ChunkReader::Memory(_))
    }

    /// Next chunk of the binary, or `None` at the end.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, TransportError> {
        match &mut self.reader {
            ChunkReader::Http(response) => Ok(response.chunk().await?),
            ChunkReader::File(file) => {
                let mut buf = vec![0u8; FILE_CHUNK_SIZE];
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    return Ok(None);
                }
                buf.truncate(n);
                Ok(Some(Bytes::from(buf)))
            }
            ChunkReader::Memory(bytes) => Ok(bytes.take()),
            ChunkReader::Channel(rx) => rx.recv().await.transpose(),
        }
    }
}

/// Open `source` and read its metadata. No body bytes are consumed.
pub(crate) async fn open(
    client: &reqwest::Client,
    config: &LoaderConfig,
    source: BinarySource,
) -> Result<Acquisition, TransportError> {
    let acquisition = match source {
        BinarySource::Url(url) => match url.scheme() {
            "http" | "https" => open_http(client, url).await?,
            "file" => {
                let path = url
                    .to_file_path()
                    .map_err(|()| TransportError::InvalidUrl(url.to_string()))?;
                open_file(&path).await?
            }
            scheme => {
                return Err(TransportError::InvalidUrl(format!(
                    "unsupported scheme `{}` in {}",
                    scheme, url
                )));
            }
        },
        BinarySource::File(path) => open_file(&path).await?,
        BinarySource::Bytes(bytes) => Acquisition {
            content_length: Some(bytes.len() as u64),
            reader: ChunkReader::Memory(Some(bytes)),
            content_type: None,
            streamable: false,
        },
        BinarySource::Stream {
            content_type,
            chunks,
        } => Acquisition {
            streamable: is_wasm_content_type(content_type.as_deref()),
            reader: ChunkReader::Channel(chunks),
            content_type,
            content_length: None,
        },
    };

    if let Some(len) = acquisition.content_length {
        if len > config.max_binary_size {
            return Err(TransportError::TooLarge {
                size: len,
                max: config.max_binary_size,
            });
        }
    }

    debug!(
        content_type = ?acquisition.content_type,
        content_length = ?acquisition.content_length,
        streamable = acquisition.streamable,
        "source opened"
    );
    Ok(acquisition)
}

async fn open_http(client: &reqwest::Client, url: Url) -> Result<Acquisition, TransportError> {
    let response = client.get(url.clone()).send().await?;

    let status = response.status();
    if !status.is_success() {
        return Err(TransportError::HttpStatus {
            status: status.as_u16(),
            url: url.to_string(),
        });
    }

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    Ok(Acquisition {
        streamable: is_wasm_content_type(content_type.as_deref()),
        content_length: response.content_length(),
        content_type,
        reader: ChunkReader::Http(response),
    })
}

async fn open_file(path: &Path) -> Result<Acquisition, TransportError> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| TransportError::Io(format!("{}: {}", path.display(), e)))?;
    let len = file.metadata().await?.len();
    Ok(Acquisition {
        reader: ChunkReader::File(file),
        content_type: None,
        content_length: Some(len),
        streamable: true,
    })
}
