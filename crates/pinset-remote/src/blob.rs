use crate::{BlobStore, ObjectMeta, RemoteConfig, RemoteError};
use pinset_schema::BlobHash;
use serde::Deserialize;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::io::{self, Read};
use std::sync::mpsc;
use std::sync::Arc;
use tracing::debug;

const CHUNK_SIZE: usize = 64 * 1024;
const CHANNEL_DEPTH: usize = 8;

fn spawn_hasher<'scope, D: Digest + Send + 'scope>(
    s: &'scope std::thread::Scope<'scope, '_>,
    rx: mpsc::Receiver<Arc<[u8]>>,
) -> std::thread::ScopedJoinHandle<'scope, String> {
    s.spawn(move || {
        let mut hasher = D::new();
        for chunk in rx {
            hasher.update(&chunk);
        }
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    })
}

/// Read `reader` to the end once, computing size, sha1 and sha256.
///
/// Each digest runs on its own thread, fed chunk by chunk while reading.
pub fn hash_stream(mut reader: impl Read) -> io::Result<BlobHash> {
    let (tx1, rx1) = mpsc::sync_channel::<Arc<[u8]>>(CHANNEL_DEPTH);
    let (tx256, rx256) = mpsc::sync_channel::<Arc<[u8]>>(CHANNEL_DEPTH);

    std::thread::scope(|s| {
        let sha1 = spawn_hasher::<Sha1>(s, rx1);
        let sha256 = spawn_hasher::<Sha256>(s, rx256);

        let mut size = 0u64;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let read_result = loop {
            match reader.read(&mut buf) {
                Ok(0) => break Ok(()),
                Ok(n) => {
                    size += n as u64;
                    let chunk: Arc<[u8]> = Arc::from(&buf[..n]);
                    if tx1.send(Arc::clone(&chunk)).is_err() || tx256.send(chunk).is_err() {
                        break Err(io::Error::other("hasher thread exited early"));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => break Err(e),
            }
        };
        drop(tx1);
        drop(tx256);

        let sha1 = sha1
            .join()
            .map_err(|_| io::Error::other("sha1 hasher panicked"))?;
        let sha256 = sha256
            .join()
            .map_err(|_| io::Error::other("sha256 hasher panicked"))?;
        read_result?;

        Ok(BlobHash {
            size: Some(size),
            sha1: Some(sha1),
            sha256: Some(sha256),
        })
    })
}

fn encode_component(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

#[derive(Debug, Deserialize)]
struct ObjectResource {
    generation: String,
    size: String,
}

/// Cloud storage client speaking the JSON object API.
///
/// - `GET /storage/v1/b/<bucket>/o/<object>` for metadata
/// - `GET /storage/v1/b/<bucket>/o/<object>?alt=media&generation=<g>` for bytes
pub struct HttpBlobStore {
    base_url: String,
    token: Option<String>,
    agent: ureq::Agent,
}

impl HttpBlobStore {
    pub fn new(config: &RemoteConfig) -> Self {
        Self {
            base_url: config.storage_url.trim_end_matches('/').to_owned(),
            token: config.storage_token.clone(),
            agent: ureq::Agent::new_with_defaults(),
        }
    }

    fn object_url(&self, bucket: &str, object: &str) -> String {
        format!(
            "{}/storage/v1/b/{}/o/{}",
            self.base_url,
            encode_component(bucket),
            encode_component(object)
        )
    }

    fn do_get(
        &self,
        url: &str,
        what: &str,
    ) -> Result<ureq::http::Response<ureq::Body>, RemoteError> {
        let mut req = self.agent.get(url);
        if let Some(ref token) = self.token {
            req = req.header("Authorization", &format!("Bearer {token}"));
        }
        debug!("GET {url}");
        match req.call() {
            Ok(resp) => Ok(resp),
            Err(ureq::Error::StatusCode(404)) => Err(RemoteError::NotFound(what.to_owned())),
            Err(ureq::Error::StatusCode(code)) => {
                Err(RemoteError::Http(format!("HTTP {code} for {what}")))
            }
            Err(e) => Err(RemoteError::Http(format!("{what}: {e}"))),
        }
    }
}

impl BlobStore for HttpBlobStore {
    fn stat(&self, bucket: &str, object: &str) -> Result<ObjectMeta, RemoteError> {
        let what = format!("gs://{bucket}/{object}");
        let resp = self.do_get(&self.object_url(bucket, object), &what)?;
        let mut body = String::new();
        resp.into_body()
            .into_reader()
            .read_to_string(&mut body)
            .map_err(|e| RemoteError::Http(format!("{what}: {e}")))?;
        let meta: ObjectResource = serde_json::from_str(&body)
            .map_err(|e| RemoteError::Serialization(format!("{what}: {e}")))?;
        let bad = |field: &str, e: &dyn std::fmt::Display| {
            RemoteError::Serialization(format!("{what}: bad {field}: {e}"))
        };
        Ok(ObjectMeta {
            generation: meta.generation.parse().map_err(|e| bad("generation", &e))?,
            size: meta.size.parse().map_err(|e| bad("size", &e))?,
        })
    }

    fn open(
        &self,
        bucket: &str,
        object: &str,
        generation: i64,
    ) -> Result<Box<dyn Read + Send>, RemoteError> {
        let what = format!("gs://{bucket}/{object}#{generation}");
        let url = format!(
            "{}?alt=media&generation={generation}",
            self.object_url(bucket, object)
        );
        let resp = self.do_get(&url, &what)?;
        Ok(Box::new(resp.into_body().into_reader()))
    }
}
