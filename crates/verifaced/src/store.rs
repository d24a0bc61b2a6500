use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use tokio_rusqlite::Connection;
use veriface_core::Descriptor;

/// Largest descriptor dimension accepted for storage.
const MAX_DIMENSION: usize = 4096;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to seal descriptor")]
    Seal,
    #[error("failed to open sealed descriptor (wrong key or corrupted row)")]
    Unseal,
    #[error("sealed descriptor has {got} bytes, expected {expected}")]
    BlobLength { expected: usize, got: usize },
    #[error("descriptor dimension {0} outside 1..={MAX_DIMENSION}")]
    Dimension(usize),
    #[error("descriptor contains NaN or infinite values")]
    NonFinite,
    #[error("key file {path}: {source}")]
    KeyFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// AES-256-GCM sealing of descriptor values.
///
/// A sealed blob is `nonce (12) || ciphertext || tag (16)`; the plaintext is
/// the values as little-endian `f32`.
#[derive(Clone)]
struct DescriptorCipher {
    aead: Aes256Gcm,
}

impl DescriptorCipher {
    fn new(key: &[u8; KEY_LEN]) -> Self {
        Self {
            aead: Aes256Gcm::new(key.into()),
        }
    }

    fn seal(&self, values: &[f32]) -> Result<Vec<u8>, StoreError> {
        check_values(values)?;
        let plaintext: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let sealed = self
            .aead
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
            .map_err(|_| StoreError::Seal)?;

        Ok([nonce.as_slice(), sealed.as_slice()].concat())
    }

    fn open(&self, blob: &[u8], dimension: usize) -> Result<Vec<f32>, StoreError> {
        if dimension == 0 || dimension > MAX_DIMENSION {
            return Err(StoreError::Dimension(dimension));
        }
        if blob.len() <= NONCE_LEN {
            return Err(StoreError::BlobLength {
                expected: NONCE_LEN + dimension * 4 + 16,
                got: blob.len(),
            });
        }
        let (nonce, sealed) = blob.split_at(NONCE_LEN);
        let plaintext = self
            .aead
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| StoreError::Unseal)?;
        decode_values(&plaintext, dimension)
    }
}

fn check_values(values: &[f32]) -> Result<(), StoreError> {
    if values.is_empty() || values.len() > MAX_DIMENSION {
        return Err(StoreError::Dimension(values.len()));
    }
    if !values.iter().all(|v| v.is_finite()) {
        return Err(StoreError::NonFinite);
    }
    Ok(())
}

fn decode_values(bytes: &[u8], dimension: usize) -> Result<Vec<f32>, StoreError> {
    if bytes.len() != dimension * 4 {
        return Err(StoreError::BlobLength {
            expected: dimension * 4,
            got: bytes.len(),
        });
    }
    let values: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    check_values(&values)?;
    Ok(values)
}

/// Read the installation key at `path`, creating it (mode 0600) on first use.
fn installation_key(path: &Path) -> Result<[u8; KEY_LEN], StoreError> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let key_error = |source| StoreError::KeyFile {
        path: path.to_path_buf(),
        source,
    };

    match std::fs::read(path) {
        Ok(bytes) => {
            let key = <[u8; KEY_LEN]>::try_from(bytes.as_slice()).map_err(|_| {
                key_error(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("expected {KEY_LEN} bytes, found {}", bytes.len()),
                ))
            })?;
            tracing::debug!(path = %path.display(), "using existing descriptor key");
            Ok(key)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let mut key = [0u8; KEY_LEN];
            OsRng.fill_bytes(&mut key);
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(path)
                .map_err(key_error)?;
            file.write_all(&key).map_err(key_error)?;
            tracing::info!(path = %path.display(), "created descriptor key");
            Ok(key)
        }
        Err(e) => Err(key_error(e)),
    }
}

/// Encrypted per-subject reference descriptors in SQLite.
///
/// Each row records its descriptor dimension so references produced by
/// different detectors can live side by side; a session only ever uses
/// those matching its seed. The key lives in `.key` beside the database.
#[derive(Clone)]
pub struct ReferenceStore {
    conn: Connection,
    cipher: DescriptorCipher,
}

impl ReferenceStore {
    /// Open or create the database. `:memory:` uses a fixed all-zero key.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        let key = if db_path == Path::new(":memory:") {
            [0u8; KEY_LEN]
        } else {
            let dir = db_path.parent().unwrap_or(Path::new("."));
            std::fs::create_dir_all(dir).map_err(|source| StoreError::KeyFile {
                path: dir.to_path_buf(),
                source,
            })?;
            installation_key(&dir.join(".key"))?
        };

        let conn = Connection::open(db_path).await?;
        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 CREATE TABLE IF NOT EXISTS references_v1 (
                     id TEXT PRIMARY KEY,
                     subject TEXT NOT NULL,
                     label TEXT NOT NULL,
                     dimension INTEGER NOT NULL,
                     sealed BLOB NOT NULL,
                     quality_score REAL NOT NULL DEFAULT 0.0,
                     created_at TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS references_v1_subject
                     ON references_v1(subject, created_at);",
            )?;
            Ok(())
        })
        .await?;

        Ok(Self {
            conn,
            cipher: DescriptorCipher::new(&key),
        })
    }

    /// Store a reference for `subject`. Returns its ID.
    pub async fn insert(
        &self,
        subject: &str,
        label: &str,
        descriptor: &Descriptor,
        quality_score: f32,
    ) -> Result<String, StoreError> {
        let sealed = self.cipher.seal(descriptor.values())?;
        let dimension = descriptor.dimension() as i64;
        let id = uuid::Uuid::new_v4().to_string();
        let row = (
            id.clone(),
            subject.to_owned(),
            label.to_owned(),
            chrono::Utc::now().to_rfc3339(),
        );

        self.conn
            .call(move |conn| {
                let (id, subject, label, created_at) = row;
                conn.execute(
                    "INSERT INTO references_v1
                         (id, subject, label, dimension, sealed, quality_score, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![id, subject, label, dimension, sealed, quality_score, created_at],
                )?;
                Ok(())
            })
            .await?;

        tracing::debug!(subject, label, dimension, "reference stored");
        Ok(id)
    }

    /// Decrypted references for `subject`, oldest first.
    pub async fn references_for_subject(
        &self,
        subject: &str,
    ) -> Result<Vec<StoredReference>, StoreError> {
        let subject = subject.to_owned();
        let rows: Vec<(String, String, i64, Vec<u8>, String)> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, label, dimension, sealed, created_at FROM references_v1
                     WHERE subject = ?1 ORDER BY created_at",
                )?;
                let rows = stmt
                    .query_map([&subject], |r| {
                        Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        // Decryption stays off the SQLite thread.
        rows.into_iter()
            .map(|(id, label, dimension, sealed, created_at)| {
                let dimension = usize::try_from(dimension).unwrap_or(0);
                let values = self.cipher.open(&sealed, dimension)?;
                let descriptor =
                    Descriptor::from_raw(&values).map_err(|_| StoreError::NonFinite)?;
                Ok(StoredReference {
                    id,
                    label,
                    descriptor,
                    created_at,
                })
            })
            .collect()
    }

    /// Reference metadata for `subject`, without descriptors.
    pub async fn list_by_subject(&self, subject: &str) -> Result<Vec<ReferenceInfo>, StoreError> {
        let subject = subject.to_owned();
        let infos = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, label, dimension, quality_score, created_at FROM references_v1
                     WHERE subject = ?1 ORDER BY created_at",
                )?;
                let infos = stmt
                    .query_map([&subject], |r| {
                        Ok(ReferenceInfo {
                            id: r.get(0)?,
                            label: r.get(1)?,
                            dimension: r.get(2)?,
                            quality_score: r.get(3)?,
                            created_at: r.get(4)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(infos)
            })
            .await?;
        Ok(infos)
    }

    /// Delete a reference. Only succeeds when it belongs to `subject`.
    pub async fn remove(&self, subject: &str, reference_id: &str) -> Result<bool, StoreError> {
        let (subject, reference_id) = (subject.to_owned(), reference_id.to_owned());
        let deleted = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM references_v1 WHERE id = ?1 AND subject = ?2",
                    [&reference_id, &subject],
                )?)
            })
            .await?;
        Ok(deleted > 0)
    }

    pub async fn count_all(&self) -> Result<u64, StoreError> {
        let count = self
            .conn
            .call(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM references_v1", [], |r| {
                    r.get::<_, u64>(0)
                })?)
            })
            .await?;
        Ok(count)
    }
}

/// A decrypted reference, ready to seed a session.
#[derive(Debug, Clone)]
pub struct StoredReference {
    pub id: String,
    pub label: String,
    pub descriptor: Descriptor,
    pub created_at: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ReferenceInfo {
    pub id: String,
    pub label: String,
    pub dimension: i64,
    pub quality_score: f64,
    pub created_at: String,
}
