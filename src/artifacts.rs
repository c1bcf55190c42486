//! Immutable image storage. Every write gets its own URI; nothing is ever
//! overwritten, so a regenerated attempt lands next to the earlier ones.
//! Writing the same bytes under the same name again is a no-op, which makes
//! a re-run stage safe after a crash.

use chrono::Utc;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::File;
use std::io::{Cursor, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

use crate::error::ArtifactError;
use crate::store::{Artifact, ArtifactKind, JobId, Stage};

pub trait ArtifactStore: Send + Sync {
    fn put(
        &self,
        job: JobId,
        kind: ArtifactKind,
        attempt: u32,
        stage: Stage,
        image: &DynamicImage,
    ) -> Result<Artifact, ArtifactError>;

    /// Describes whatever is already stored under this name, e.g. written
    /// by a run that died before the job store recorded it.
    fn recover(
        &self,
        job: JobId,
        kind: ArtifactKind,
        attempt: u32,
        stage: Stage,
    ) -> Result<Artifact, ArtifactError>;

    fn load(&self, uri: &str) -> Result<Arc<DynamicImage>, ArtifactError>;
}

fn artifact_name(kind: ArtifactKind, attempt: u32, stage: Stage) -> String {
    format!("{:02}-{}-{}", attempt, stage, kind)
}

fn checksum(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

fn describe(
    kind: ArtifactKind,
    attempt: u32,
    stage: Stage,
    uri: String,
    checksum: String,
    image: &DynamicImage,
) -> Artifact {
    Artifact {
        kind,
        attempt,
        stage,
        uri,
        checksum: Some(checksum),
        width: image.width(),
        height: image.height(),
        created_at: Utc::now(),
    }
}

/// Keeps decoded images in memory. Used by tests and one-shot CLI runs.
#[derive(Default)]
pub struct MemoryArtifactStore {
    images: RwLock<HashMap<String, Arc<DynamicImage>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.images
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn put(
        &self,
        job: JobId,
        kind: ArtifactKind,
        attempt: u32,
        stage: Stage,
        image: &DynamicImage,
    ) -> Result<Artifact, ArtifactError> {
        let uri = memory_uri(job, kind, attempt, stage);
        let digest = checksum(image.as_bytes());
        let mut images = self.images.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = images.get(&uri) {
            if checksum(existing.as_bytes()) != digest {
                return Err(ArtifactError::AlreadyExists(uri));
            }
        } else {
            images.insert(uri.clone(), Arc::new(image.clone()));
        }
        Ok(describe(kind, attempt, stage, uri, digest, image))
    }

    fn recover(
        &self,
        job: JobId,
        kind: ArtifactKind,
        attempt: u32,
        stage: Stage,
    ) -> Result<Artifact, ArtifactError> {
        let uri = memory_uri(job, kind, attempt, stage);
        let image = self.load(&uri)?;
        let digest = checksum(image.as_bytes());
        Ok(describe(kind, attempt, stage, uri, digest, &image))
    }

    fn load(&self, uri: &str) -> Result<Arc<DynamicImage>, ArtifactError> {
        self.images
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(uri)
            .cloned()
            .ok_or_else(|| ArtifactError::NotFound(uri.to_string()))
    }
}

fn memory_uri(job: JobId, kind: ArtifactKind, attempt: u32, stage: Stage) -> String {
    format!("memory://{}/{}", job, artifact_name(kind, attempt, stage))
}

const PREVIEW_JPEG_QUALITY: u8 = 90;
const PRINT_JPEG_QUALITY: u8 = 95;

/// Writes artifacts under `<root>/<job id>/`. Previews and print files are
/// JPEG, intermediates are lossless PNG.
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, ArtifactError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn jpeg_quality(kind: ArtifactKind) -> Option<u8> {
        match kind {
            ArtifactKind::Preview => Some(PREVIEW_JPEG_QUALITY),
            ArtifactKind::PrintReady => Some(PRINT_JPEG_QUALITY),
            _ => None,
        }
    }

    fn path_for(&self, job: JobId, kind: ArtifactKind, attempt: u32, stage: Stage) -> PathBuf {
        let extension = if Self::jpeg_quality(kind).is_some() { "jpg" } else { "png" };
        self.root
            .join(job.to_string())
            .join(format!("{}.{}", artifact_name(kind, attempt, stage), extension))
    }

    fn encode(kind: ArtifactKind, image: &DynamicImage) -> Result<Vec<u8>, ArtifactError> {
        let mut bytes = Vec::new();
        match Self::jpeg_quality(kind) {
            Some(quality) => {
                let encoder = JpegEncoder::new_with_quality(&mut bytes, quality);
                DynamicImage::ImageRgb8(image.to_rgb8()).write_with_encoder(encoder)?;
            }
            None => image.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?,
        }
        Ok(bytes)
    }
}

/// Writes `bytes` next to `path` and links the finished file into place, so
/// `path` either holds a complete image or does not exist. Fails with
/// `AlreadyExists` rather than replacing an existing file.
fn write_new(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let written = File::create(&tmp).and_then(|mut file| {
        file.write_all(bytes)?;
        file.sync_all()
    });
    let linked = written.and_then(|_| std::fs::hard_link(&tmp, path));
    if let Err(e) = std::fs::remove_file(&tmp) {
        debug!("Could not remove {}: {}", tmp.display(), e);
    }
    linked
}

impl ArtifactStore for FsArtifactStore {
    fn put(
        &self,
        job: JobId,
        kind: ArtifactKind,
        attempt: u32,
        stage: Stage,
        image: &DynamicImage,
    ) -> Result<Artifact, ArtifactError> {
        let path = self.path_for(job, kind, attempt, stage);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let uri = path.display().to_string();

        let bytes = Self::encode(kind, image)?;
        let digest = checksum(&bytes);
        match write_new(&path, &bytes) {
            Ok(()) => debug!("Wrote {} ({} bytes)", uri, bytes.len()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                if checksum(&std::fs::read(&path)?) != digest {
                    return Err(ArtifactError::AlreadyExists(uri));
                }
                debug!("{} already holds these bytes", uri);
            }
            Err(e) => return Err(e.into()),
        }

        Ok(describe(kind, attempt, stage, uri, digest, image))
    }

    fn recover(
        &self,
        job: JobId,
        kind: ArtifactKind,
        attempt: u32,
        stage: Stage,
    ) -> Result<Artifact, ArtifactError> {
        let path = self.path_for(job, kind, attempt, stage);
        let uri = path.display().to_string();
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(ArtifactError::NotFound(uri)),
            Err(e) => return Err(e.into()),
        };
        let image = image::load_from_memory(&bytes)?;
        Ok(describe(kind, attempt, stage, uri, checksum(&bytes), &image))
    }

    fn load(&self, uri: &str) -> Result<Arc<DynamicImage>, ArtifactError> {
        let path = PathBuf::from(uri);
        if !path.exists() {
            return Err(ArtifactError::NotFound(uri.to_string()));
        }
        Ok(Arc::new(image::open(&path)?))
    }
}
